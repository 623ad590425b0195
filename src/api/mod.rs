//! HTTP surface: route wiring, middleware stack, and the OpenAPI document.

use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    routing::{delete, get, post},
    Extension, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;

pub use handlers::AppState;

use handlers::{auth, health};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::salt,
        auth::register,
        auth::login,
        auth::mfa_verify,
        auth::refresh,
        auth::logout,
        auth::list_sessions,
        auth::revoke_session,
        auth::mfa_setup,
        auth::mfa_confirm,
        auth::mfa_disable,
        auth::list_audit,
    ),
    components(schemas(
        crate::error::ErrorBody,
        health::Health,
        auth::types::SaltResponse,
        auth::types::RegisterRequest,
        auth::types::RegisterResponse,
        auth::types::IdentityResponse,
        auth::types::TokenResponse,
        auth::types::LoginRequest,
        auth::types::LoginResponse,
        crate::auth::mfa::MfaMethod,
        auth::types::MfaVerifyRequest,
        auth::types::RefreshRequest,
        auth::types::LogoutRequest,
        auth::types::SessionResponse,
        auth::types::MfaSetupResponse,
        auth::types::MfaConfirmRequest,
        auth::types::MfaConfirmResponse,
        auth::types::MfaDisableRequest,
        auth::types::AuditRecordResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Zero-knowledge authentication and session lifecycle"),
        (name = "health", description = "Service health")
    )
)]
struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Build the application router over shared state.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/v1/auth/salt", get(auth::salt))
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/mfa/verify", post(auth::mfa_verify))
        .route("/v1/auth/refresh", post(auth::refresh))
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/auth/sessions", get(auth::list_sessions))
        .route("/v1/auth/sessions/:id", delete(auth::revoke_session))
        .route("/v1/auth/mfa/setup", post(auth::mfa_setup))
        .route("/v1/auth/mfa/confirm", post(auth::mfa_confirm))
        .route("/v1/auth/mfa/disable", post(auth::mfa_disable))
        .route("/v1/auth/audit", get(auth::list_audit))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(state)),
        )
}

/// Bind and serve until the process is stopped.
/// # Errors
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(port: u16, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
