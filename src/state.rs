//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the storage seam, the process-scoped room registry and the token
//! verifier. There is no global state: everything that needs the registry
//! receives it from here.

use std::sync::Arc;

use crate::hub::registry::Hub;
use crate::services::auth::TokenMaker;
use crate::services::store::GameStore;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn GameStore>,
    pub hub: Arc<Hub>,
    pub tokens: Arc<TokenMaker>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn GameStore>, tokens: TokenMaker) -> Self {
        Self { store, hub: Arc::new(Hub::new()), tokens: Arc::new(tokens) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
