//! Request gate in front of the distribution routes.
//!
//! The gate only answers "who is this and may they act as admin". Token
//! issuance, key rotation and the like live outside patchd; deployments
//! either configure static bearer tokens or run open.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub admin: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid bearer token")]
    Invalid,
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> Result<Identity, AuthError>;
}

/// Accepts every request as a non-admin anonymous client.
#[derive(Debug, Default)]
pub struct OpenAuthorizer;

impl Authorizer for OpenAuthorizer {
    fn authorize(&self, _headers: &HeaderMap) -> Result<Identity, AuthError> {
        Ok(Identity { subject: "anonymous".into(), admin: false })
    }
}

/// Bearer tokens fixed at startup. The admin token is accepted everywhere and
/// is the only one that carries the admin role.
#[derive(Debug)]
pub struct StaticTokenAuthorizer {
    tokens: Vec<String>,
    admin_token: Option<String>,
}

impl StaticTokenAuthorizer {
    pub fn new(tokens: Vec<String>, admin_token: Option<String>) -> Self {
        let tokens = tokens.into_iter().filter(|t| !t.is_empty()).collect();
        let admin_token = admin_token.filter(|t| !t.is_empty());
        Self { tokens, admin_token }
    }
}

fn token_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    let raw = headers.get(AUTHORIZATION).ok_or(AuthError::Missing)?;
    let raw = raw.to_str().map_err(|_| AuthError::Invalid)?;
    let (scheme, token) = raw.split_once(' ').ok_or(AuthError::Invalid)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::Invalid);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let token = bearer(headers)?;
        if let Some(admin) = &self.admin_token {
            if token_eq(token, admin) {
                return Ok(Identity { subject: "admin".into(), admin: true });
            }
        }
        // index rather than the token itself so logs never carry secrets
        match self.tokens.iter().position(|t| token_eq(token, t)) {
            Some(i) => Ok(Identity { subject: format!("token-{i}"), admin: false }),
            None => Err(AuthError::Invalid),
        }
    }
}
