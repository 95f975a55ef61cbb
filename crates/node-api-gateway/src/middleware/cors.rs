//! CORS layer built from the gateway configuration.

use crate::domain::config::CorsConfig;
use axum::http::{HeaderName, Method};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Create the CORS layer for the REST router.
pub fn create_cors_layer(config: &CorsConfig) -> CorsLayer {
    if !config.enabled {
        return CorsLayer::very_permissive();
    }

    let mut cors = CorsLayer::new();

    if config.allowed_origins.iter().any(|o| o == "*") {
        cors = cors.allow_origin(Any);
    } else {
        let origins: Vec<_> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors = cors.allow_origin(origins);
    }

    let methods: Vec<Method> = config
        .allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    cors = cors.allow_methods(methods);

    if config.allowed_headers.iter().any(|h| h == "*") {
        cors = cors.allow_headers(Any);
    } else {
        let headers: Vec<HeaderName> = config
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        cors = cors.allow_headers(headers);
    }

    cors.max_age(Duration::from_secs(config.max_age))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn preflight(config: &CorsConfig, origin: &str) -> axum::http::Response<Body> {
        let app = Router::new()
            .route("/probe", get(|| async { "ok" }))
            .layer(create_cors_layer(config));
        app.oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/probe")
                .header("origin", origin)
                .header("access-control-request-method", "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_wildcard_origin() {
        let response = preflight(&CorsConfig::default(), "https://wallet.example").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
    }

    #[tokio::test]
    async fn test_listed_origin_only() {
        let config = CorsConfig {
            allowed_origins: vec!["https://explorer.example".to_string()],
            ..CorsConfig::default()
        };

        let allowed = preflight(&config, "https://explorer.example").await;
        assert_eq!(
            allowed.headers()["access-control-allow-origin"],
            "https://explorer.example"
        );

        let other = preflight(&config, "https://elsewhere.example").await;
        assert!(other.headers().get("access-control-allow-origin").is_none());
    }
}
