//! Authorization token supply.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthorizationError {
    /// The provider cannot sign for this resource form. Callers retry with
    /// the name-based form.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    Other(String),
}

/// Produces the `authorization` header for a request.
///
/// `resource_address` is what the request targets on the wire (an id-based
/// or name-based address); `resource_path` is the resource type segment such
/// as `docs` or `colls`.
pub trait AuthorizationTokenProvider: Send + Sync {
    fn token(
        &self,
        resource_address: &str,
        resource_path: &str,
        method: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, AuthorizationError>;

    /// Token for the name-based form of the address. Providers that only
    /// know one form keep the default.
    fn name_based_token(
        &self,
        resource_address: &str,
        resource_path: &str,
        method: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, AuthorizationError> {
        let _ = (resource_path, method, headers);
        Err(AuthorizationError::Unauthorized(format!(
            "no name-based token for '{}'",
            resource_address
        )))
    }
}

/// Sends requests without an `authorization` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthorization;

impl AuthorizationTokenProvider for NoAuthorization {
    fn token(
        &self,
        _resource_address: &str,
        _resource_path: &str,
        _method: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<String, AuthorizationError> {
        Ok(String::new())
    }
}

/// A fixed master token, for tests and local emulators.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl AuthorizationTokenProvider for StaticToken {
    fn token(
        &self,
        _resource_address: &str,
        _resource_path: &str,
        _method: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<String, AuthorizationError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_name_based_token_is_unauthorized() {
        let headers = HashMap::new();
        let err = StaticToken("t".to_string())
            .name_based_token("dbs/db", "dbs", "GET", &headers)
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::Unauthorized(_)));
        assert_eq!(
            StaticToken("t".to_string())
                .token("dbs/db", "dbs", "GET", &headers)
                .unwrap(),
            "t"
        );
        assert!(NoAuthorization.token("x", "docs", "GET", &headers).unwrap().is_empty());
    }
}
