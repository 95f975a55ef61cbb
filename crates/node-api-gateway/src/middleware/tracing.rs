//! Request tracing and accounting for the REST surface.
//!
//! Every request gets a [`CorrelationId`], an `api_request` span carrying it,
//! an `x-request-id` response header and an entry in [`GatewayMetrics`].

use super::metrics::{GatewayMetrics, RequestTimer};
use crate::domain::correlation::CorrelationId;
use axum::{body::Body, http::HeaderValue, http::Request, response::Response};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{info_span, Instrument, Span};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct TracingLayer {
    metrics: Arc<GatewayMetrics>,
}

impl TracingLayer {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
    metrics: Arc<GatewayMetrics>,
}

impl<S> Service<Request<Body>> for TracingService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let timer = RequestTimer::new(Arc::clone(&self.metrics));

        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<CorrelationId>().ok())
            .unwrap_or_default();
        req.extensions_mut().insert(request_id);

        let span = info_span!(
            "api_request",
            request_id = %request_id,
            http.method = %req.method(),
            http.target = %req.uri().path(),
            http.status = tracing::field::Empty,
        );

        Box::pin(
            async move {
                let result = inner.call(req).await;
                match result {
                    Ok(mut response) => {
                        let status = response.status();
                        Span::current().record("http.status", status.as_u16());
                        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
                            response.headers_mut().insert(REQUEST_ID_HEADER, value);
                        }
                        // Upgraded sockets count as served once the handshake answers.
                        timer.finish(status.is_success() || status.is_informational());
                        Ok(response)
                    }
                    Err(e) => {
                        timer.finish(false);
                        Err(e)
                    }
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Extension, Router};
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let metrics = Arc::new(GatewayMetrics::new());
        let app = Router::new()
            .route(
                "/id",
                get(|Extension(id): Extension<CorrelationId>| async move { id.to_string() }),
            )
            .layer(TracingLayer::new(Arc::clone(&metrics)));
        let id = CorrelationId::new();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/id")
                    .header(REQUEST_ID_HEADER, id.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], id.to_string().as_str());
        assert_eq!(metrics.requests_success.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failed_request_is_counted() {
        let metrics = Arc::new(GatewayMetrics::new());
        let app = Router::new()
            .route("/fail", get(|| async { StatusCode::BAD_GATEWAY }))
            .layer(TracingLayer::new(Arc::clone(&metrics)));

        let response = app
            .oneshot(Request::builder().uri("/fail").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(metrics.requests_error.load(Ordering::Relaxed), 1);
    }
}
