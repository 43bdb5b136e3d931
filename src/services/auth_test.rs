use super::*;
use std::time::Duration;

use jsonwebtoken::{EncodingKey, Header};

const SECRET: &str = "test-secret-test-secret-test-secret!!";

fn maker() -> TokenMaker {
    TokenMaker::new(SECRET).expect("secret long enough")
}

#[test]
fn short_secret_is_rejected() {
    assert!(matches!(TokenMaker::new("short"), Err(AuthError::SecretTooShort)));
}

#[test]
fn minted_token_round_trips_user_id() {
    let tokens = maker();
    let user_id = Uuid::new_v4();
    let raw = tokens
        .new_access_token(user_id, Duration::from_secs(900))
        .expect("sign");
    assert_eq!(tokens.parse_access_token(&raw).expect("verify"), user_id);
}

#[test]
fn token_signed_with_other_secret_is_rejected() {
    let other = TokenMaker::new("another-secret-another-secret-123456").expect("secret");
    let raw = other
        .new_access_token(Uuid::new_v4(), Duration::from_secs(900))
        .expect("sign");
    assert!(matches!(maker().parse_access_token(&raw), Err(AuthError::InvalidToken(_))));
}

#[test]
fn expired_token_is_rejected() {
    let now = unix_now();
    let claims = AccessClaims {
        iss: TOKEN_ISSUER.into(),
        iat: now - 7200,
        nbf: now - 7200,
        exp: now - 3600,
        uid: Uuid::new_v4().to_string(),
    };
    let raw = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("sign");
    assert!(matches!(maker().parse_access_token(&raw), Err(AuthError::InvalidToken(_))));
}

#[test]
fn wrong_issuer_is_rejected() {
    let now = unix_now();
    let claims = AccessClaims {
        iss: "someone-else".into(),
        iat: now,
        nbf: now,
        exp: now + 600,
        uid: Uuid::new_v4().to_string(),
    };
    let raw = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("sign");
    assert!(maker().parse_access_token(&raw).is_err());
}

#[test]
fn non_uuid_subject_is_rejected() {
    let now = unix_now();
    let claims =
        AccessClaims { iss: TOKEN_ISSUER.into(), iat: now, nbf: now, exp: now + 600, uid: "not-a-uuid".into() };
    let raw = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("sign");
    assert!(matches!(maker().parse_access_token(&raw), Err(AuthError::InvalidSubject(s)) if s == "not-a-uuid"));
}

#[test]
fn garbage_is_rejected() {
    assert!(maker().parse_access_token("not.a.jwt").is_err());
    assert!(maker().parse_access_token("").is_err());
}
