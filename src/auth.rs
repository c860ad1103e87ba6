//! Minimal stand-in for the `auth_gateway` collaborator (§6.1): turns
//! request headers into a `Principal`. A production registry would swap
//! this for a real OAuth2/JWT resource server; here it reads a bearer
//! token plus explicit scope/group/username headers, which is enough to
//! drive and test the federation scope check in §4.5.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::collections::HashSet;

use crate::error::FederationError;
use crate::models::Principal;

pub struct AuthenticatedPrincipal(pub Principal);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedPrincipal {
    type Rejection = FederationError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let Some(_token) = token else {
            return Err(FederationError::Unauthenticated);
        };

        let username = headers
            .get("x-federation-username")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let client_id = headers
            .get("x-federation-client-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let scopes = parse_list_header(headers, "x-federation-scopes");
        let groups = parse_list_header(headers, "x-federation-groups");

        Ok(AuthenticatedPrincipal(Principal {
            username,
            client_id,
            scopes,
            groups,
        }))
    }
}

fn parse_list_header(headers: &axum::http::HeaderMap, name: &str) -> HashSet<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Raised by export handlers after extraction: §4.5's scope gate.
pub fn require_federation_scope(principal: &Principal) -> Result<(), FederationError> {
    if principal.has_federation_scope() {
        Ok(())
    } else {
        Err(FederationError::Unauthorized(
            "principal lacks federation-service or federation/read scope".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_check_accepts_either_known_scope() {
        let mut principal = Principal::default();
        principal.scopes.insert("federation-service".to_string());
        assert!(require_federation_scope(&principal).is_ok());

        let mut principal2 = Principal::default();
        principal2.scopes.insert("federation/read".to_string());
        assert!(require_federation_scope(&principal2).is_ok());
    }

    #[test]
    fn scope_check_rejects_missing_scope() {
        let principal = Principal::default();
        assert!(require_federation_scope(&principal).is_err());
    }
}
