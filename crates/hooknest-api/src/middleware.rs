//! Middleware for hooknest-api
//!
//! Request-id propagation: every request carries an id (inbound
//! `X-Request-ID` wins, otherwise one is minted) and every response echoes
//! it back.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The request id for the current request, available via extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Inject (or propagate) the request id and echo it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(hooknest_core::request_id);

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_cloneable_extension() {
        let id = RequestId("req_abc".to_string());
        assert_eq!(id.clone().0, "req_abc");
    }
}
