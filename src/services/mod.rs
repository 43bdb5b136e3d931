//! Domain services used by the socket layer.
//!
//! ARCHITECTURE
//! ============
//! Service modules own persistence and token concerns so the socket
//! handler can stay focused on protocol translation and room state.

pub mod auth;
pub mod room;
pub mod round;
pub mod store;
