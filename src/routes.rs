use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{any, get, post},
};
use http::{HeaderName, HeaderValue, Method, header};
use tower_cookies::CookieManagerLayer;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::{handlers, middleware_layer, state::AppState};

/// Largest request body the gateway relays.
const MAX_BODY_BYTES: usize = 1024 * 1024;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("⚠️  Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(handlers::proxy::VIN_HEADER),
            HeaderName::from_static(handlers::proxy::PLAYER_HEADER),
        ])
        .allow_credentials(true)
        .max_age(Duration::from_secs(86400))
}

/// Builds the gateway router.
pub fn app(state: AppState) -> Router {
    let mut login_routes = Router::new()
        .route("/api/login", post(handlers::auth::login))
        .with_state(state.clone());
    if let Some(limit) = state.config.login_rate_limit {
        login_routes = middleware_layer::rate_limit::limit_by_ip(login_routes, limit);
    }

    let public_routes = Router::new()
        .route("/health", get(handlers::vehicles::health))
        .route("/api/logout", post(handlers::auth::logout))
        .route("/api/refresh", post(handlers::auth::refresh))
        .route("/api/proxy/{*path}", any(handlers::proxy::proxy))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/user", get(handlers::auth::user))
        .route("/api/vehicles", get(handlers::vehicles::list_vehicles))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ))
        .with_state(state.clone());

    Router::new()
        .merge(login_routes)
        .merge(public_routes)
        .merge(protected_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default())
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .layer(CookieManagerLayer::new())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer(&state.config.cors_origins))
}
