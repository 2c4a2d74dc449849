//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Response envelopes
//!
//! # API Structure
//!
//! The broker drives the agent with plain `GET` requests:
//!
//! - `/`, `/healthz`: liveness
//! - `/discover`: free space on the storage volume
//! - `/provision/{service_id}/{plan_id}/{size}`, `/unprovision/{service_id}`,
//!   `/credentials/{service_id}`: service lifecycle
//!
//! Every response is HTTP 200. Failures are reported inside the JSON envelope through
//! `success: false` and a message, never through the status code.
//!
//! # OpenAPI Documentation
//!
//! Endpoints are annotated with `utoipa`. The document is served at `/api-docs/openapi.json`
//! and rendered at `/docs`.

pub mod handlers;
pub mod models;

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(title = "sharedfs agent", description = "Provisions SSH accounts on a shared filesystem"),
    paths(
        handlers::system::root,
        handlers::system::healthz,
        handlers::system::discover,
        handlers::services::provision,
        handlers::services::unprovision,
        handlers::services::credentials,
    ),
    components(schemas(
        models::system::DiscoverResponse,
        models::services::StatusResponse,
        models::services::CredentialsResponse,
        crate::provisioner::Credentials,
    )),
    tags(
        (name = "system", description = "Liveness and capacity"),
        (name = "services", description = "Service account lifecycle"),
    )
)]
pub struct ApiDoc;
