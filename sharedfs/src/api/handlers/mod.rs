//! HTTP request handlers.
//!
//! - [`system`]: banner, health check and capacity discovery
//! - [`services`]: provisioning, unprovisioning and credential retrieval
//!
//! Handlers never fail at the HTTP level; provisioner outcomes are copied into the response
//! envelope as they are.

pub mod services;
pub mod system;

/// Router over a fake OS and an in-memory store, with homes in a fresh temporary directory.
#[cfg(test)]
pub(crate) fn test_server(os: std::sync::Arc<crate::test_utils::FakeOs>) -> (axum_test::TestServer, tempfile::TempDir) {
    use crate::{AppState, build_router, db::InMemoryServiceStore, provisioner::UserProvisioner, test_utils::test_config};
    use std::sync::Arc;

    let root = tempfile::tempdir().expect("temp home root");
    let config = Arc::new(test_config(root.path()));
    let provisioner = UserProvisioner::new(os, Arc::new(InMemoryServiceStore::new()), config.clone());
    let state = AppState::builder().config(config).provisioner(provisioner).build();
    let server = axum_test::TestServer::new(build_router(state)).expect("Failed to create test server");
    (server, root)
}
