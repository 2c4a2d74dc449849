//! HTTP handlers for the service lifecycle.

use axum::{
    Json,
    extract::{Path, State},
};
use std::future::Future;
use tracing::{Instrument, Span, error};

use crate::{
    AppState,
    api::models::services::{CredentialsResponse, StatusResponse},
    provisioner::Outcome,
};

/// Run a provisioner operation on its own task.
///
/// The request future is dropped when the client disconnects; the spawned task is not, so an
/// operation always runs to completion once started.
async fn run_to_completion<T>(operation: impl Future<Output = T> + Send + 'static) -> Result<T, String>
where
    T: Send + 'static,
{
    tokio::spawn(operation.instrument(Span::current())).await.map_err(|e| {
        error!(error = %e, "provisioner task did not complete");
        e.to_string()
    })
}

#[utoipa::path(
    get,
    path = "/provision/{service_id}/{plan_id}/{size}",
    tag = "services",
    summary = "Provision a service",
    description = "Create an OS account with a fresh keypair and record it under the service ID",
    params(
        ("service_id" = String, Path, description = "Broker-assigned service identifier"),
        ("plan_id" = String, Path, description = "Plan the service was ordered under"),
        ("size" = String, Path, description = "Quota descriptor, stored as given"),
    ),
    responses(
        (status = 200, description = "Outcome of the provisioning", body = StatusResponse),
    )
)]
#[tracing::instrument(skip_all, fields(service_id = %service_id))]
pub async fn provision(
    State(state): State<AppState>,
    Path((service_id, plan_id, size)): Path<(String, String, String)>,
) -> Json<StatusResponse> {
    let provisioner = state.provisioner.clone();
    let outcome = run_to_completion(async move { provisioner.provision(&service_id, &plan_id, &size).await })
        .await
        .unwrap_or_else(Outcome::failed);
    Json(StatusResponse::new(&state.config.agent_name, outcome))
}

#[utoipa::path(
    get,
    path = "/unprovision/{service_id}",
    tag = "services",
    summary = "Unprovision a service",
    description = "Delete the service's home and OS account, then forget the record",
    params(
        ("service_id" = String, Path, description = "Broker-assigned service identifier"),
    ),
    responses(
        (status = 200, description = "Outcome of the removal", body = StatusResponse),
    )
)]
#[tracing::instrument(skip_all, fields(service_id = %service_id))]
pub async fn unprovision(State(state): State<AppState>, Path(service_id): Path<String>) -> Json<StatusResponse> {
    let provisioner = state.provisioner.clone();
    let outcome = run_to_completion(async move { provisioner.unprovision(&service_id).await })
        .await
        .unwrap_or_else(Outcome::failed);
    Json(StatusResponse::new(&state.config.agent_name, outcome))
}

#[utoipa::path(
    get,
    path = "/credentials/{service_id}",
    tag = "services",
    summary = "Get credentials",
    description = "Return the SSH private key and connection details for a service",
    params(
        ("service_id" = String, Path, description = "Broker-assigned service identifier"),
    ),
    responses(
        (status = 200, description = "Credentials, or the reason they are unavailable", body = CredentialsResponse),
    )
)]
#[tracing::instrument(skip_all, fields(service_id = %service_id))]
pub async fn credentials(State(state): State<AppState>, Path(service_id): Path<String>) -> Json<CredentialsResponse> {
    let provisioner = state.provisioner.clone();
    let (outcome, credentials) = run_to_completion(async move { provisioner.credentials(&service_id).await })
        .await
        .unwrap_or_else(|message| (Outcome::failed(message), None));
    Json(CredentialsResponse::new(&state.config.agent_name, outcome, credentials))
}

#[cfg(test)]
mod tests {
    use crate::api::handlers::test_server;
    use crate::api::models::services::{CredentialsResponse, StatusResponse};
    use crate::db::{InMemoryServiceStore, ServiceStore};
    use crate::provisioner::UserProvisioner;
    use crate::test_utils::{FakeOs, test_config};
    use crate::{AppState, build_router};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_full_lifecycle() {
        let os = Arc::new(FakeOs::new());
        let (server, root) = test_server(os.clone());

        let response = server.get("/provision/cef52253/90b3d933/2048").await;
        response.assert_status_ok();
        let provisioned: StatusResponse = response.json();
        assert!(provisioned.success, "{}", provisioned.msg);
        assert_eq!(provisioned.msg, "OK");
        assert_eq!(provisioned.name, "sharedfs-test");

        let response = server.get("/credentials/cef52253").await;
        response.assert_status_ok();
        let found: CredentialsResponse = response.json();
        assert!(found.success);
        let credentials = found.credentials.unwrap();
        let key_path = root.path().join(&credentials.username).join(".ssh/id_rsa");
        assert_eq!(credentials.identity, std::fs::read_to_string(key_path).unwrap());
        assert_eq!(credentials.port, 22);

        let response = server.get("/unprovision/cef52253").await;
        response.assert_status_ok();
        let removed: StatusResponse = response.json();
        assert!(removed.success);
        assert!(os.user(&credentials.username).is_none());

        let response = server.get("/credentials/cef52253").await;
        response.assert_status_ok();
        let json: Value = response.json();
        assert_eq!(json["success"], false);
        assert_eq!(json["msg"], "Service cef52253 not found");
        assert!(json["credentials"].is_null());
    }

    #[tokio::test]
    async fn test_unprovision_unknown_service() {
        let (server, _root) = test_server(Arc::new(FakeOs::new()));

        let response = server.get("/unprovision/nope").await;
        response.assert_status_ok();
        let json: Value = response.json();
        assert_eq!(json["name"], "sharedfs-test");
        assert_eq!(json["success"], false);
        assert_eq!(json["msg"], "Service nope not found");
    }

    #[tokio::test]
    async fn test_provision_failure_is_reported_in_the_envelope() {
        let os = Arc::new(FakeOs::new());
        os.fail_program("useradd", 1);
        let (server, _root) = test_server(os);

        let response = server.get("/provision/cef52253/90b3d933/2048").await;
        response.assert_status_ok();
        let json: Value = response.json();
        assert_eq!(json["success"], false);
        assert!(json["msg"].as_str().unwrap().contains("useradd"));
    }

    #[test_log::test(tokio::test)]
    async fn test_provision_completes_after_client_disconnects() {
        let os = Arc::new(FakeOs::new());
        os.delay_program("chown", Duration::from_millis(800));
        let root = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(root.path()));
        let store = Arc::new(InMemoryServiceStore::new());
        let provisioner = UserProvisioner::new(os.clone(), store.clone(), config.clone());
        let state = AppState::builder().config(config).provisioner(provisioner).build();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, build_router(state)).await });

        // Hang up while the account is half built.
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /provision/svc-1/plan-a/2048 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(client);

        let started = Instant::now();
        while !store.exists_by_service_id("svc-1").await.unwrap() {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "provision stopped after {:?}",
                os.executed_commands().iter().map(|c| c.program().to_string()).collect::<Vec<_>>()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(os.count_of("chown"), 1);
        assert_eq!(os.count_of("su"), 1);
        assert_eq!(os.count_of("mv"), 1);
        assert_eq!(os.count_of("id"), 2);
    }
}
