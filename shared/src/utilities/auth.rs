use axum::{
    extract::Request,
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::utilities::errors::AppError;

/// Decode an `Authorization: Basic` header value into `(username, password)`.
pub fn decode_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

fn request_credentials(request: &Request) -> Option<(String, String)> {
    let header = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
    decode_basic(header)
}

/// Basic-auth guard used by the agent, central handler and PMDS surfaces.
/// Any request presenting a non-empty username passes; everything else is
/// rejected with the fixed 401 body.
pub async fn require_basic_auth(request: Request, next: Next) -> Response {
    match request_credentials(&request) {
        Some((username, _)) if !username.is_empty() => next.run(request).await,
        _ => AppError::UnauthorizedError.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_username_and_password() {
        // "serrano:secret"
        let decoded = decode_basic("Basic c2VycmFubzpzZWNyZXQ=").unwrap();
        assert_eq!(decoded, ("serrano".to_owned(), "secret".to_owned()));
    }

    #[test]
    fn rejects_non_basic_schemes() {
        assert!(decode_basic("Bearer abcdef").is_none());
        assert!(decode_basic("Basic !!!").is_none());
    }
}
