//! Startup repair of OS accounts lost while their records survived.
//!
//! After a VM rebuild the persistent disk (homes and the database) comes back but `/etc/passwd`
//! does not. For every stored record the reconciler asks `getent passwd` whether the account
//! exists. A definite "absent" answer recreates the group, when it is missing too, and then the
//! account with the recorded uid, gid and name, bound to the home that is already on disk. The
//! home, keys and authorized keys are never touched.
//!
//! With no drift the pass only issues read-only probes, so it is safe to run on every start.

use crate::db::ServiceRecord;
use crate::errors::Result;
use crate::provisioner::UserProvisioner;
use crate::provisioner::commands::{self, GETENT_NOT_FOUND};
use crate::provisioner::username::is_generated_username;
use tracing::{error, info, instrument, warn};

/// What one reconciliation pass found and did, by username.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub present: Vec<String>,
    pub recreated: Vec<String>,
    /// Probe gave no definite answer; left alone until the next pass
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn checked(&self) -> usize {
        self.present.len() + self.recreated.len() + self.skipped.len() + self.failed.len()
    }
}

enum Presence {
    Present,
    Absent,
    Unknown,
}

impl UserProvisioner {
    /// Recreate every recorded account that the OS no longer knows about.
    ///
    /// A failure on one record is logged and does not stop the others. Only listing the
    /// records can fail the pass as a whole.
    #[instrument(skip(self))]
    pub async fn verify_users_exist(&self) -> Result<ReconcileReport> {
        let records = self.store().all().await?;
        let mut report = ReconcileReport::default();

        for record in records {
            let username = record.username.clone();
            if !is_generated_username(&username) {
                error!(service_id = %record.service_id, username, "record has an unusable username");
                report.failed.push(username);
                continue;
            }

            match self.account_presence(&username).await {
                Presence::Present => report.present.push(username),
                Presence::Unknown => report.skipped.push(username),
                Presence::Absent => match self.recreate_account(&record).await {
                    Ok(()) => {
                        info!(service_id = %record.service_id, username, uid = %record.uid, gid = %record.gid, "recreated missing account");
                        report.recreated.push(username);
                    }
                    Err(e) => {
                        error!(service_id = %record.service_id, username, error = %e, "failed to recreate account");
                        report.failed.push(username);
                    }
                },
            }
        }

        info!(
            checked = report.checked(),
            recreated = report.recreated.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn account_presence(&self, username: &str) -> Presence {
        let result = self.probe(&commands::getent_passwd(username)).await;
        if result.success() {
            Presence::Present
        } else if result.status == GETENT_NOT_FOUND && !result.timed_out {
            Presence::Absent
        } else {
            warn!(username, status = result.status, timed_out = result.timed_out, output = %result.output, "account probe inconclusive, skipping");
            Presence::Unknown
        }
    }

    async fn recreate_account(&self, record: &ServiceRecord) -> Result<()> {
        let username = record.username.as_str();
        let group_probe = commands::getent_group(username);
        let group = self.probe(&group_probe).await;
        if group.status == GETENT_NOT_FOUND && !group.timed_out {
            self.exec(&commands::groupadd_with_gid(username, &record.gid)).await?;
        } else if !group.success() {
            group.into_checked(&group_probe, self.config().commands.timeout)?;
        }

        let home = self.layout(username);
        self.exec(&commands::useradd_with_ids(
            username,
            home.home(),
            &self.config().login_shell,
            &record.uid,
            &record.gid,
        ))
        .await?;
        Ok(())
    }
}
