//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for comparing
//! credentials without exposing them elsewhere.

pub use secrecy::{ExposeSecret, SecretString};

/// True when `candidate` equals the secret. Empty candidates never match.
pub fn secret_matches(secret: &SecretString, candidate: &str) -> bool {
    !candidate.is_empty() && secret.expose_secret() == candidate
}
