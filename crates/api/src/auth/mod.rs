//! Authentication for realtime clients

pub mod jwt;

use axum::http::{header::AUTHORIZATION, HeaderMap};

pub use jwt::{Claims, JwtError, JwtVerifier};

/// Credential from an `Authorization: Bearer` header, falling back to a
/// `token` query parameter (browsers cannot set headers on `EventSource`)
pub fn credential<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| query_token.filter(|t| !t.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(credential(&headers, Some("xyz")), Some("abc"));
    }

    #[test]
    fn test_query_fallback() {
        let mut headers = HeaderMap::new();
        assert_eq!(credential(&headers, Some("xyz")), Some("xyz"));
        assert_eq!(credential(&headers, Some("")), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(credential(&headers, None), None);
    }
}
