//! OS account lifecycle for provisioned services.
//!
//! A service moves `absent -> active -> absent`. [`UserProvisioner::provision`] builds the
//! account and its home step by step and records it; [`UserProvisioner::unprovision`] tears
//! both down and forgets the record only once the OS side is gone.
//!
//! Every public operation turns internal failures into an unsuccessful [`Outcome`] carrying the
//! error message, after logging it. Nothing is rolled back when a step fails half way: the
//! partial account stays behind for an operator to inspect.

pub mod commands;
pub mod username;

use crate::config::Config;
use crate::db::{ServiceRecord, ServiceStore};
use crate::errors::{Error, Result};
use crate::exec::{CommandLine, CommandResult, CommandRunner, retry};
use anyhow::anyhow;
use commands::{GETENT_NOT_FOUND, HomeLayout};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use utoipa::ToSchema;

/// SSH port advertised in credentials.
pub const SSH_PORT: u16 = 22;

/// Success flag and message returned by every provisioner operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: "OK".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// What a client needs to reach its share over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Credentials {
    pub username: String,
    pub hostname: String,
    pub host: String,
    pub port: u16,
    /// Private key, exactly as stored in the account's `.ssh/id_rsa`
    pub identity: String,
    /// Comma-separated CIDRs, present only when configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firewall_allow_rules: Option<String>,
}

/// Drives account creation and removal through a [`CommandRunner`] and keeps the
/// [`ServiceStore`] in step with it.
#[derive(Clone)]
pub struct UserProvisioner {
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn ServiceStore>,
    config: Arc<Config>,
}

impl UserProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, store: Arc<dyn ServiceStore>, config: Arc<Config>) -> Self {
        Self { runner, store, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn ServiceStore {
        self.store.as_ref()
    }

    pub(crate) fn layout(&self, username: &str) -> HomeLayout {
        HomeLayout::new(&self.config.home_root, username)
    }

    /// Run `command` under the configured deadline and retry policy, failing on a non-zero
    /// exit or timeout.
    pub(crate) async fn exec(&self, command: &CommandLine) -> Result<String> {
        let commands = &self.config.commands;
        let result = retry::run_with_retry(self.runner.as_ref(), command, commands.timeout, commands.retry).await;
        Ok(result.into_checked(command, commands.timeout)?)
    }

    /// Run a read-only probe once and hand back the raw result. A non-zero status is an answer
    /// here ("absent"), not a failure, so it is never retried.
    pub(crate) async fn probe(&self, command: &CommandLine) -> CommandResult {
        self.runner.run(command, self.config.commands.timeout).await
    }

    #[instrument(skip(self), fields(username))]
    pub async fn provision(&self, service_id: &str, plan_id: &str, quota: &str) -> Outcome {
        match self.try_provision(service_id, plan_id, quota).await {
            Ok(record) => {
                info!(service_id, username = %record.username, uid = %record.uid, "service provisioned");
                Outcome::ok()
            }
            Err(e) => {
                error!(service_id, error = %e, "error provisioning");
                Outcome::failed(e.to_string())
            }
        }
    }

    async fn try_provision(&self, service_id: &str, plan_id: &str, quota: &str) -> Result<ServiceRecord> {
        let username = self.pick_username().await?;
        tracing::Span::current().record("username", username.as_str());
        let layout = self.layout(&username);

        self.exec(&commands::mkdir_p(&[layout.ssh_dir(), layout.data_dir()])).await?;
        self.exec(&commands::useradd(&username, layout.home(), &self.config.login_shell))
            .await?;
        self.exec(&commands::chown_recursive(&username, layout.home())).await?;
        self.exec(&commands::restrict_to_owner(layout.home())).await?;
        self.exec(&commands::ssh_keygen_as(&username, &layout.private_key())).await?;
        self.exec(&commands::rename(&layout.public_key(), &layout.authorized_keys()))
            .await?;

        let uid = self.exec(&commands::id_uid(&username)).await?.trim().to_string();
        let gid = self.exec(&commands::id_gid(&username)).await?.trim().to_string();

        let record = ServiceRecord {
            service_id: service_id.to_string(),
            plan_id: plan_id.to_string(),
            quota: quota.to_string(),
            username,
            uid,
            gid,
        };
        Ok(self.store.create(&record).await?)
    }

    /// Draw random names until one is not yet known to the OS.
    async fn pick_username(&self) -> Result<String> {
        let attempts = self.config.username_attempts.max(1);
        for _ in 0..attempts {
            let candidate = username::generate_username();
            let probe = commands::getent_passwd(&candidate);
            let result = self.probe(&probe).await;
            if result.status == GETENT_NOT_FOUND && !result.timed_out {
                return Ok(candidate);
            }
            if !result.success() {
                // Neither "free" nor "taken": surface the probe failure.
                result.into_checked(&probe, self.config.commands.timeout)?;
            }
            debug!(candidate, "username already taken, drawing another");
        }
        Err(Error::Other(anyhow!("no free username after {attempts} attempts")))
    }

    #[instrument(skip(self))]
    pub async fn unprovision(&self, service_id: &str) -> Outcome {
        match self.try_unprovision(service_id).await {
            Ok(()) => Outcome::ok(),
            Err(e @ Error::NotFound { .. }) => Outcome::failed(e.to_string()),
            Err(e) => {
                error!(service_id, error = %e, retryable = e.is_retryable(), "error unprovisioning");
                Outcome::failed(e.to_string())
            }
        }
    }

    async fn try_unprovision(&self, service_id: &str) -> Result<()> {
        let record = self.find(service_id).await?;
        info!(service_id, username = %record.username, "unprovisioning service");

        if record.username.is_empty() {
            return Err(Error::InvalidRecord {
                service_id: service_id.to_string(),
                reason: "Empty username".to_string(),
            });
        }
        if !username::is_generated_username(&record.username) {
            return Err(Error::InvalidRecord {
                service_id: service_id.to_string(),
                reason: format!("Invalid username {:?}", record.username),
            });
        }

        let layout = self.layout(&record.username);
        self.exec(&commands::remove_tree(layout.home())).await?;
        self.exec(&commands::userdel(&record.username)).await?;

        self.store.delete_by_service_id(service_id).await?;
        Ok(())
    }

    /// Look up the credentials for a service.
    ///
    /// Returns a successful outcome with `Some` credentials, or an unsuccessful outcome carrying
    /// the error message with `None`. An unknown service is the latter.
    #[instrument(skip(self))]
    pub async fn credentials(&self, service_id: &str) -> (Outcome, Option<Credentials>) {
        match self.try_credentials(service_id).await {
            Ok(credentials) => (Outcome::ok(), Some(credentials)),
            Err(e @ Error::NotFound { .. }) => (Outcome::failed(e.to_string()), None),
            Err(e) => {
                error!(service_id, error = %e, "error getting credentials");
                (Outcome::failed(e.to_string()), None)
            }
        }
    }

    async fn try_credentials(&self, service_id: &str) -> Result<Credentials> {
        let record = self.find(service_id).await?;
        info!(service_id, "getting credentials");

        let path = self.layout(&record.username).private_key();
        let identity = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| Error::Io { path, source })?;

        Ok(Credentials {
            username: record.username,
            hostname: self.config.agent_dns_address.clone(),
            host: self.config.agent_dns_address.clone(),
            port: SSH_PORT,
            identity,
            firewall_allow_rules: self.config.firewall_allow_rules_joined(),
        })
    }

    /// Free bytes on the volume holding the homes.
    #[instrument(skip(self))]
    pub async fn disk_free(&self) -> Result<u64> {
        let output = self.exec(&commands::disk_free(&self.config.storage_volume)).await?;
        commands::parse_disk_free(&output).ok_or_else(|| Error::Other(anyhow!("unexpected df output: {output:?}")))
    }

    async fn find(&self, service_id: &str) -> Result<ServiceRecord> {
        self.store
            .find_by_service_id(service_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                service_id: service_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryServiceStore;
    use crate::test_utils::{FakeOs, ScriptedRunner, test_config};
    use std::path::Path;
    use tempfile::TempDir;

    struct Harness {
        _root: TempDir,
        os: Arc<FakeOs>,
        store: Arc<InMemoryServiceStore>,
        provisioner: UserProvisioner,
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        tweak(&mut config);
        let os = Arc::new(FakeOs::new());
        let store = Arc::new(InMemoryServiceStore::new());
        let provisioner = UserProvisioner::new(os.clone(), store.clone(), Arc::new(config));
        Harness {
            _root: root,
            os,
            store,
            provisioner,
        }
    }

    impl Harness {
        async fn record(&self, service_id: &str) -> ServiceRecord {
            self.store.find_by_service_id(service_id).await.unwrap().unwrap()
        }

        fn home_root(&self) -> &Path {
            &self.provisioner.config().home_root
        }
    }

    #[test_log::test(tokio::test)]
    async fn provision_builds_the_account_and_records_it() {
        let h = harness();

        let outcome = h.provisioner.provision("svc-1", "plan-a", "2048").await;
        assert_eq!(outcome, Outcome::ok());

        let record = h.record("svc-1").await;
        assert!(username::is_generated_username(&record.username));
        assert_eq!(record.plan_id, "plan-a");
        assert_eq!(record.quota, "2048");

        let user = h.os.user(&record.username).expect("account exists");
        assert_eq!(record.uid, user.uid.to_string());
        assert_eq!(record.gid, user.gid.to_string());
        assert_eq!(user.home, h.home_root().join(&record.username));
        assert_eq!(user.shell, "/bin/bash");

        let layout = HomeLayout::new(h.home_root(), &record.username);
        assert!(layout.data_dir().is_dir());
        assert!(layout.private_key().is_file());
        assert!(layout.authorized_keys().is_file());
        assert!(!layout.public_key().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn provision_denies_group_and_other_access_to_the_home() {
        use std::os::unix::fs::PermissionsExt;

        let h = harness();
        h.provisioner.provision("svc-1", "plan-a", "2048").await;
        let record = h.record("svc-1").await;

        let mode = std::fs::metadata(h.home_root().join(&record.username)).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0, "mode {mode:o}");
    }

    #[tokio::test]
    async fn authorized_keys_holds_the_matching_public_key() {
        let h = harness();
        h.provisioner.provision("svc-1", "plan-a", "2048").await;
        let record = h.record("svc-1").await;
        let layout = HomeLayout::new(h.home_root(), &record.username);

        let private = std::fs::read_to_string(layout.private_key()).unwrap();
        let authorized = std::fs::read_to_string(layout.authorized_keys()).unwrap();
        assert_eq!(authorized, FakeOs::public_key_for(&private));
    }

    #[tokio::test]
    async fn provision_then_credentials_returns_the_key_verbatim() {
        let h = harness_with(|config| {
            config.agent_dns_address = "sharedfs-0.example.internal".to_string();
            config.firewall_allow_rules = Some(vec!["10.0.16.0/24".to_string(), "10.0.17.0/24".to_string()]);
        });
        h.provisioner.provision("svc-1", "plan-a", "2048").await;
        let record = h.record("svc-1").await;

        let (outcome, credentials) = h.provisioner.credentials("svc-1").await;
        assert_eq!(outcome, Outcome::ok());
        let credentials = credentials.unwrap();

        let on_disk = std::fs::read(HomeLayout::new(h.home_root(), &record.username).private_key()).unwrap();
        assert_eq!(credentials.identity.as_bytes(), on_disk.as_slice());
        assert_eq!(credentials.username, record.username);
        assert_eq!(credentials.hostname, "sharedfs-0.example.internal");
        assert_eq!(credentials.host, "sharedfs-0.example.internal");
        assert_eq!(credentials.port, 22);
        assert_eq!(credentials.firewall_allow_rules.as_deref(), Some("10.0.16.0/24,10.0.17.0/24"));
    }

    #[tokio::test]
    async fn credentials_omit_firewall_rules_when_unset() {
        let h = harness();
        h.provisioner.provision("svc-1", "plan-a", "2048").await;
        let (_, credentials) = h.provisioner.credentials("svc-1").await;
        let json = serde_json::to_value(credentials.unwrap()).unwrap();
        assert!(json.get("firewall_allow_rules").is_none());
    }

    #[tokio::test]
    async fn unprovision_unknown_service_changes_nothing() {
        let h = harness();
        h.provisioner.provision("svc-1", "plan-a", "2048").await;
        h.os.clear_history();

        let outcome = h.provisioner.unprovision("nope").await;
        assert_eq!(outcome, Outcome::failed("Service nope not found"));
        assert!(h.os.executed_commands().is_empty());
        assert!(h.store.exists_by_service_id("svc-1").await.unwrap());
    }

    #[tokio::test]
    async fn credentials_for_unknown_service() {
        let h = harness();
        let (outcome, credentials) = h.provisioner.credentials("nope").await;
        assert_eq!(outcome, Outcome::failed("Service nope not found"));
        assert!(credentials.is_none());
    }

    #[tokio::test]
    async fn provision_unprovision_credentials_is_not_found() {
        let h = harness();
        assert!(h.provisioner.provision("svc-1", "plan-a", "2048").await.success);
        let record = h.record("svc-1").await;

        assert_eq!(h.provisioner.unprovision("svc-1").await, Outcome::ok());
        assert!(h.os.user(&record.username).is_none());
        assert!(!h.home_root().join(&record.username).exists());

        let (outcome, credentials) = h.provisioner.credentials("svc-1").await;
        assert_eq!(outcome, Outcome::failed("Service svc-1 not found"));
        assert!(credentials.is_none());
    }

    #[tokio::test]
    async fn failed_userdel_keeps_the_record_for_a_retry() {
        let h = harness();
        h.provisioner.provision("svc-1", "plan-a", "2048").await;
        h.os.fail_program("userdel", 8);

        let outcome = h.provisioner.unprovision("svc-1").await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("STATUS: 8"), "{}", outcome.message);
        assert!(h.store.exists_by_service_id("svc-1").await.unwrap());

        // Second attempt succeeds once the OS cooperates.
        h.os.clear_failures();
        assert_eq!(h.provisioner.unprovision("svc-1").await, Outcome::ok());
        assert!(!h.store.exists_by_service_id("svc-1").await.unwrap());
    }

    #[tokio::test]
    async fn empty_username_fails_fast() {
        let h = harness();
        h.store
            .create(&ServiceRecord {
                service_id: "svc-1".into(),
                plan_id: "plan-a".into(),
                quota: "2048".into(),
                username: String::new(),
                uid: "1001".into(),
                gid: "1001".into(),
            })
            .await
            .unwrap();

        let outcome = h.provisioner.unprovision("svc-1").await;
        assert_eq!(outcome, Outcome::failed("Empty username for service_id: svc-1"));
        assert!(h.os.executed_commands().is_empty());
        assert!(h.store.exists_by_service_id("svc-1").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_username_never_reaches_rm() {
        let h = harness();
        h.store
            .create(&ServiceRecord {
                service_id: "svc-1".into(),
                plan_id: "plan-a".into(),
                quota: "2048".into(),
                username: "..".into(),
                uid: "1001".into(),
                gid: "1001".into(),
            })
            .await
            .unwrap();

        let outcome = h.provisioner.unprovision("svc-1").await;
        assert!(!outcome.success);
        assert!(h.os.executed_commands().is_empty());
    }

    #[tokio::test]
    async fn failing_step_aborts_without_recording() {
        let h = harness();
        h.os.fail_program("chown", 1);

        let outcome = h.provisioner.provision("svc-1", "plan-a", "2048").await;
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("Command \"chown -R"), "{}", outcome.message);
        assert!(!h.store.exists_by_service_id("svc-1").await.unwrap());
        // No rollback: the account created before the failing step is still there.
        assert_eq!(h.os.count_of("useradd"), 1);
        assert_eq!(h.os.count_of("userdel"), 0);
        assert_eq!(h.os.count_of("su"), 0);
    }

    #[tokio::test]
    async fn timed_out_step_reports_the_timeout() {
        let h = harness();
        h.os.hang_program("su");

        let outcome = h.provisioner.provision("svc-1", "plan-a", "2048").await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("timed out"), "{}", outcome.message);
        assert!(h.store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_service_id_is_refused_by_the_store() {
        let h = harness();
        assert!(h.provisioner.provision("svc-1", "plan-a", "2048").await.success);
        let outcome = h.provisioner.provision("svc-1", "plan-a", "2048").await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Unique constraint violation"), "{}", outcome.message);
        assert_eq!(h.store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn taken_usernames_are_skipped() {
        let runner = Arc::new(
            ScriptedRunner::new()
                // first candidate exists, second is free
                .respond(CommandResult {
                    status: 0,
                    output: "taken:x:1001:1001::/home/taken:/bin/bash\n".into(),
                    timed_out: false,
                    pid: None,
                })
                .respond(CommandResult {
                    status: GETENT_NOT_FOUND,
                    output: String::new(),
                    timed_out: false,
                    pid: None,
                }),
        );
        let root = tempfile::tempdir().unwrap();
        let provisioner = UserProvisioner::new(
            runner.clone(),
            Arc::new(InMemoryServiceStore::new()),
            Arc::new(test_config(root.path())),
        );

        let name = provisioner.pick_username().await.unwrap();
        let probes = runner.executed_commands();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[1].get_args(), ["passwd", name.as_str()]);
        assert_ne!(probes[0].get_args()[1], name);
    }

    #[tokio::test]
    async fn gives_up_when_every_username_is_taken() {
        let runner = Arc::new(ScriptedRunner::new().fallback(CommandResult {
            status: 0,
            output: String::new(),
            timed_out: false,
            pid: None,
        }));
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config.username_attempts = 3;
        let provisioner = UserProvisioner::new(runner.clone(), Arc::new(InMemoryServiceStore::new()), Arc::new(config));

        let outcome = provisioner.provision("svc-1", "plan-a", "2048").await;
        assert_eq!(outcome, Outcome::failed("no free username after 3 attempts"));
        assert_eq!(runner.executed_commands().len(), 3);
    }

    #[tokio::test]
    async fn disk_free_reports_bytes() {
        let h = harness();
        h.os.set_free_kb(57_581_288);
        assert_eq!(h.provisioner.disk_free().await.unwrap(), 57_581_288 * 1024);

        let cmd = h.os.executed_commands().pop().unwrap();
        assert_eq!(cmd.program(), "df");
        assert_eq!(cmd.get_args().last().map(String::as_str), Some("/var/vcap/store"));
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_retried_under_the_configured_policy() {
        let h = harness_with(|config| {
            config.commands.retry = crate::exec::RetryPolicy::new(3, std::time::Duration::from_secs(2));
        });
        h.os.fail_program_times("chmod", 1, 2);

        let outcome = h.provisioner.provision("svc-1", "plan-a", "2048").await;
        assert_eq!(outcome, Outcome::ok());
        assert_eq!(h.os.count_of("chmod"), 3);
    }
}
