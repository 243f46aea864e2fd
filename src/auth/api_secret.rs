use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use subtle::ConstantTimeEq;

use crate::errors::auth_error::{AuthError, AuthResult};

fn api_secret_matches(token: &str, secret: &str) -> bool {
    bool::from(token.as_bytes().ct_eq(secret.as_bytes()))
}

/// Extract the bearer token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> AuthResult<&str> {
    headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuthHeader)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthHeader)?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or(AuthError::InvalidAuthHeader)
}

/// Check the request against the configured key; no key means open access.
pub fn authorize(headers: &HeaderMap, auth_key: Option<&str>) -> AuthResult<()> {
    let Some(secret) = auth_key.filter(|k| !k.is_empty()) else {
        return Ok(());
    };
    let token = bearer_token(headers)?;
    if api_secret_matches(token, secret) {
        Ok(())
    } else {
        Err(AuthError::Unauthorized("token does not match".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_open_access_without_key() {
        assert!(authorize(&HeaderMap::new(), None).is_ok());
        assert!(authorize(&HeaderMap::new(), Some("")).is_ok());
    }

    #[test]
    fn test_matching_token() {
        assert!(authorize(&headers("Bearer s3cret"), Some("s3cret")).is_ok());
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            authorize(&HeaderMap::new(), Some("s3cret")),
            Err(AuthError::MissingAuthHeader)
        ));
        assert!(matches!(
            authorize(&headers("Basic abc"), Some("s3cret")),
            Err(AuthError::InvalidAuthHeader)
        ));
        assert!(matches!(
            authorize(&headers("Bearer wrong"), Some("s3cret")),
            Err(AuthError::Unauthorized(_))
        ));
    }
}
