//! Abstract request/response transport.
//!
//! The gateway core never parses wire bytes; the embedding host hands it
//! `http` requests with [`Bytes`] bodies and provides the forwarding edge:
//! an [`Upstream`] wrapping an in-process application, or an [`HttpClient`]
//! that reaches backend servers.

use crate::error::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, Request as HttpRequest, Response as HttpResponse, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};

pub type Request = HttpRequest<Bytes>;
pub type Response = HttpResponse<Bytes>;

/// In-process application the gateway wraps in plugin mode.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(&self, req: Request) -> Result<Response, GatewayError>;
}

/// Bidirectional byte stream used for WebSocket pass-through.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Forwarding edge for standalone mode; one implementation serves every
/// backend in the pool.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send `req` to the backend rooted at `base_url`.
    async fn forward(&self, base_url: &str, req: Request) -> Result<Response, GatewayError>;

    /// Health probe; the default sends `HEAD /` and accepts any response
    /// below 500.
    async fn probe(&self, base_url: &str) -> bool {
        let req = HttpRequest::builder()
            .method(http::Method::HEAD)
            .uri("/")
            .body(Bytes::new());
        match req {
            Ok(req) => match self.forward(base_url, req).await {
                Ok(response) => response.status().as_u16() < 500,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// Open a raw duplex stream for an upgraded connection.
    async fn open_stream(
        &self,
        _base_url: &str,
        _req: &Request,
    ) -> Result<Box<dyn IoStream>, GatewayError> {
        Err(GatewayError::Upstream("backend does not support upgrades".into()))
    }
}

/// Build an [`Upstream`] from an async closure; handy for plugin hosts
/// and tests.
pub fn upstream_fn<F, Fut>(f: F) -> impl Upstream
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Response, GatewayError>> + Send + 'static,
{
    type CallFn =
        Box<dyn Fn(Request) -> BoxFuture<'static, Result<Response, GatewayError>> + Send + Sync>;

    struct FnUpstream(CallFn);

    #[async_trait]
    impl Upstream for FnUpstream {
        async fn call(&self, req: Request) -> Result<Response, GatewayError> {
            (self.0)(req).await
        }
    }

    FnUpstream(Box::new(move |req| Box::pin(f(req))))
}

/// Copy method, URI, headers, and the cheaply-clonable body so retries can
/// resend a request.
pub fn clone_request(req: &Request) -> Request {
    let mut builder = HttpRequest::builder().method(req.method().clone()).uri(req.uri().clone());
    if let Some(headers) = builder.headers_mut() {
        *headers = req.headers().clone();
    }
    // Builder only fails on invalid parts, and these came from a valid request.
    builder.body(req.body().clone()).unwrap_or_else(|_| HttpRequest::new(req.body().clone()))
}

/// True when the client prefers a JSON error body.
pub fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json") || accept.contains("*/*"))
}

/// Render an error response, negotiating JSON or plain text from `Accept`.
pub fn error_response(status: StatusCode, message: &str, json: bool) -> Response {
    let (content_type, body) = if json {
        let payload = serde_json::json!({ "error": message });
        ("application/json", Bytes::from(payload.to_string()))
    } else {
        ("text/plain; charset=utf-8", Bytes::from(message.to_string()))
    };
    let mut response = HttpResponse::new(body);
    *response.status_mut() = status;
    if let Ok(value) = http::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

/// True for an RFC 6455 upgrade request.
pub fn is_websocket_upgrade(req: &Request) -> bool {
    let upgrade = req
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    let connection = req
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
    upgrade && connection
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(accept: Option<&str>) -> Request {
        let mut builder = HttpRequest::builder().method(http::Method::GET).uri("/x");
        if let Some(accept) = accept {
            builder = builder.header(ACCEPT, accept);
        }
        builder.body(Bytes::new()).unwrap()
    }

    #[test]
    fn clone_request_copies_parts() {
        let req = HttpRequest::builder()
            .method(http::Method::POST)
            .uri("/api/users?a=1")
            .header("x-request-id", "abc")
            .body(Bytes::from_static(b"payload"))
            .unwrap();

        let copy = clone_request(&req);
        assert_eq!(copy.method(), req.method());
        assert_eq!(copy.uri(), req.uri());
        assert_eq!(copy.headers().get("x-request-id"), req.headers().get("x-request-id"));
        assert_eq!(copy.body(), req.body());
    }

    #[test]
    fn accept_negotiation() {
        assert!(wants_json(request(Some("application/json")).headers()));
        assert!(wants_json(request(Some("*/*")).headers()));
        assert!(!wants_json(request(Some("text/html")).headers()));
        assert!(!wants_json(request(None).headers()));
    }

    #[test]
    fn error_response_renders_both_shapes() {
        let json = error_response(StatusCode::TOO_MANY_REQUESTS, "slow down", true);
        assert_eq!(json.status(), StatusCode::TOO_MANY_REQUESTS);
        let parsed: serde_json::Value = serde_json::from_slice(json.body()).unwrap();
        assert_eq!(parsed["error"], "slow down");

        let text = error_response(StatusCode::GATEWAY_TIMEOUT, "too slow", false);
        assert_eq!(text.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(text.body(), &Bytes::from_static(b"too slow"));
    }

    #[test]
    fn websocket_upgrade_detection() {
        let upgrade = HttpRequest::builder()
            .uri("/ws")
            .header(http::header::UPGRADE, "websocket")
            .header(http::header::CONNECTION, "keep-alive, Upgrade")
            .body(Bytes::new())
            .unwrap();
        assert!(is_websocket_upgrade(&upgrade));
        assert!(!is_websocket_upgrade(&request(None)));
    }

    #[tokio::test]
    async fn upstream_fn_adapts_closures() {
        let upstream = upstream_fn(|req: Request| async move {
            let mut response = HttpResponse::new(req.into_body());
            *response.status_mut() = StatusCode::OK;
            Ok(response)
        });
        let response = upstream
            .call(HttpRequest::new(Bytes::from_static(b"echo")))
            .await
            .unwrap();
        assert_eq!(response.body(), &Bytes::from_static(b"echo"));
    }
}
