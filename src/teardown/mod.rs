//! Reversal of every side effect recorded during provisioning.
//!
//! Steps run in reverse dependency order. Each step is skipped when the
//! ledger holds nothing for it and treats "entity does not exist" as
//! already done, so teardown can be repeated safely.

mod error;

use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::OrchestratorSettings;
use crate::control_plane::{ControlPlane, ControlPlaneError, Direction, Submission};
use crate::job::{JOB_POLL_INTERVAL, JobWaiter};
use crate::ledger::{FirewallRuleKind, Ledger, LedgerKey, LedgerStore};

pub use error::TeardownError;

/// Default wait before retrying a failed security group delete.
pub const SECURITY_GROUP_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// What a teardown run did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownReport {
    /// Instance that was destroyed, if any.
    pub destroyed_instance: Option<String>,
    /// True when no instance id was recorded.
    pub nothing_to_destroy: bool,
    /// Entities removed by this run, as `kind id`.
    pub removed: Vec<String>,
    /// Entities that were already gone, as `kind id`.
    pub already_removed: Vec<String>,
    /// Warnings for the caller.
    pub warnings: Vec<String>,
}

impl TeardownReport {
    fn removed(&mut self, what: &str, target: &str) {
        self.removed.push(format!("{what} {target}"));
    }

    fn already_removed(&mut self, what: &str, target: &str) {
        warn!(target_id = target, "{what} already removed");
        self.already_removed.push(format!("{what} {target}"));
        self.warnings.push(format!("{what} {target} was already removed"));
    }
}

/// Reverses the side effects recorded in a [`Ledger`].
#[derive(Debug)]
pub struct TeardownOrchestrator<'a, C: ?Sized, S> {
    client: &'a C,
    ledger: &'a Ledger<S>,
    expunge: bool,
    poll_interval: Duration,
    security_group_retry: Duration,
}

impl<'a, C, S> TeardownOrchestrator<'a, C, S>
where
    C: ControlPlane + ?Sized,
    S: LedgerStore,
{
    /// Creates an orchestrator that destroys without expunging.
    #[must_use]
    pub const fn new(client: &'a C, ledger: &'a Ledger<S>) -> Self {
        Self {
            client,
            ledger,
            expunge: false,
            poll_interval: JOB_POLL_INTERVAL,
            security_group_retry: SECURITY_GROUP_RETRY_BACKOFF,
        }
    }

    /// Sets whether the instance is expunged on destroy.
    #[must_use]
    pub const fn with_expunge(mut self, expunge: bool) -> Self {
        self.expunge = expunge;
        self
    }

    /// Overrides the job polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the backoff before a security group delete is retried.
    #[must_use]
    pub const fn with_security_group_retry(mut self, backoff: Duration) -> Self {
        self.security_group_retry = backoff;
        self
    }

    /// Applies process-wide settings.
    #[must_use]
    pub const fn with_settings(self, settings: &OrchestratorSettings) -> Self {
        self.with_poll_interval(settings.poll_interval())
            .with_security_group_retry(settings.security_group_retry())
    }

    /// Runs the full teardown.
    ///
    /// Without a recorded instance id the run stops after the networking
    /// steps and reports nothing to destroy.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::ApiCommand`] when a removal fails for any
    /// reason other than the entity being gone, and
    /// [`TeardownError::Ledger`] when the ledger cannot be updated.
    pub async fn teardown(&self) -> Result<TeardownReport, TeardownError> {
        let mut report = TeardownReport::default();

        self.remove_firewall_rules(&mut report).await?;
        self.disable_static_nat(&mut report).await?;
        self.remove_port_forwarding(&mut report).await?;

        let Some(instance_id) = self.ledger.instance_id()? else {
            info!("nothing to destroy");
            report.nothing_to_destroy = true;
            return Ok(report);
        };
        self.destroy_instance(&instance_id, &mut report).await?;
        self.remove_volumes(&mut report).await?;
        self.ledger.clear(LedgerKey::VmCredentials)?;
        self.release_unbound_into(&mut report).await?;
        self.ledger.clear_instance_id()?;

        info!(instance_id, "teardown complete");
        report.destroyed_instance = Some(instance_id);
        Ok(report)
    }

    /// Releases side effects that can exist before an instance does: the
    /// generated key pair and created security groups.
    ///
    /// # Errors
    ///
    /// As [`TeardownOrchestrator::teardown`].
    pub async fn release_unbound(&self) -> Result<TeardownReport, TeardownError> {
        let mut report = TeardownReport::default();
        self.release_unbound_into(&mut report).await?;
        Ok(report)
    }

    async fn release_unbound_into(&self, report: &mut TeardownReport) -> Result<(), TeardownError> {
        self.delete_key_pair(report).await?;
        self.delete_security_groups(report).await
    }

    async fn remove_firewall_rules(&self, report: &mut TeardownReport) -> Result<(), TeardownError> {
        let records = self.ledger.firewall_rules()?;
        if records.is_empty() {
            return Ok(());
        }
        for record in &records {
            match record.kind {
                FirewallRuleKind::NetworkAcl => {
                    let outcome = self.client.delete_network_acl(&record.id).await;
                    self.settle(report, "delete network ACL", &record.id, outcome)
                        .await?;
                }
                FirewallRuleKind::FirewallRule => {
                    let outcome = self.client.delete_firewall_rule(&record.id).await;
                    self.settle(report, "delete firewall rule", &record.id, outcome)
                        .await?;
                }
            }
        }
        self.ledger.clear(LedgerKey::Firewall)?;
        Ok(())
    }

    async fn disable_static_nat(&self, report: &mut TeardownReport) -> Result<(), TeardownError> {
        let addresses = self.ledger.entries(LedgerKey::StaticNat)?;
        if addresses.is_empty() {
            return Ok(());
        }
        for ip_address_id in &addresses {
            let outcome = self.client.disable_static_nat(ip_address_id).await;
            self.settle(report, "disable static NAT on", ip_address_id, outcome)
                .await?;
        }
        self.ledger.clear(LedgerKey::StaticNat)?;
        Ok(())
    }

    async fn remove_port_forwarding(
        &self,
        report: &mut TeardownReport,
    ) -> Result<(), TeardownError> {
        let rules = self.ledger.entries(LedgerKey::PortForwarding)?;
        for rule_id in &rules {
            let outcome = self.client.delete_port_forwarding_rule(rule_id).await;
            self.settle(report, "delete port forwarding rule", rule_id, outcome)
                .await?;
        }
        if !rules.is_empty() {
            self.ledger.clear(LedgerKey::PortForwarding)?;
        }
        self.ledger.clear(LedgerKey::PublicPort)?;
        self.ledger.clear(LedgerKey::PublicRdpPort)?;
        Ok(())
    }

    async fn destroy_instance(
        &self,
        instance_id: &str,
        report: &mut TeardownReport,
    ) -> Result<(), TeardownError> {
        info!(instance_id, expunge = self.expunge, "destroying instance");
        let outcome = self.client.destroy_instance(instance_id, self.expunge).await;
        self.settle(report, "destroy instance", instance_id, outcome)
            .await
    }

    async fn remove_volumes(&self, report: &mut TeardownReport) -> Result<(), TeardownError> {
        let volumes = self.ledger.entries(LedgerKey::Volumes)?;
        if volumes.is_empty() {
            return Ok(());
        }
        for volume_id in &volumes {
            let detached = self.client.detach_volume(volume_id).await;
            self.settle(report, "detach volume", volume_id, detached)
                .await?;
            let deleted = self
                .client
                .delete_volume(volume_id)
                .await
                .map(|()| Submission::default());
            self.settle(report, "delete volume", volume_id, deleted)
                .await?;
        }
        self.ledger.clear(LedgerKey::Volumes)?;
        Ok(())
    }

    async fn delete_key_pair(&self, report: &mut TeardownReport) -> Result<(), TeardownError> {
        let Some(name) = self.ledger.ssh_key_name()? else {
            return Ok(());
        };
        let outcome = self
            .client
            .delete_ssh_key_pair(&name)
            .await
            .map(|()| Submission::default());
        self.settle(report, "delete SSH key pair", &name, outcome)
            .await?;
        self.ledger.clear(LedgerKey::SshKeyName)?;
        self.ledger.clear(LedgerKey::SshKeyFile)?;
        Ok(())
    }

    async fn delete_security_groups(
        &self,
        report: &mut TeardownReport,
    ) -> Result<(), TeardownError> {
        let groups = self.ledger.entries(LedgerKey::SecurityGroups)?;
        if groups.is_empty() {
            return Ok(());
        }
        for group_id in &groups {
            self.delete_security_group(group_id, report).await?;
        }
        self.ledger.clear(LedgerKey::SecurityGroups)?;
        Ok(())
    }

    async fn delete_security_group(
        &self,
        group_id: &str,
        report: &mut TeardownReport,
    ) -> Result<(), TeardownError> {
        let group = match self.client.get_security_group(group_id).await {
            Ok(Some(group)) => group,
            Ok(None) => {
                report.already_removed("security group", group_id);
                return Ok(());
            }
            Err(err) => return Err(api_error("describe security group", group_id, err)),
        };

        let rules = group
            .ingress_rule_ids
            .iter()
            .map(|rule| (Direction::Ingress, rule))
            .chain(group.egress_rule_ids.iter().map(|rule| (Direction::Egress, rule)));
        for (direction, rule_id) in rules {
            let outcome = self.client.revoke_security_group_rule(direction, rule_id).await;
            self.settle(report, "revoke security group rule", rule_id, outcome)
                .await?;
        }

        match self.client.delete_security_group(group_id).await {
            Ok(()) => {
                report.removed("delete security group", group_id);
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                report.already_removed("security group", group_id);
                Ok(())
            }
            Err(err) => {
                warn!(
                    group_id,
                    error = %err,
                    backoff_secs = self.security_group_retry.as_secs(),
                    "security group delete failed; retrying"
                );
                report.warnings.push(format!(
                    "security group {group_id} could not be deleted yet ({err}); retried after {}s",
                    self.security_group_retry.as_secs()
                ));
                sleep(self.security_group_retry).await;
                let retried = self
                    .client
                    .delete_security_group(group_id)
                    .await
                    .map(|()| Submission::default());
                self.settle(report, "delete security group", group_id, retried)
                    .await
            }
        }
    }

    async fn settle(
        &self,
        report: &mut TeardownReport,
        action: &'static str,
        target: &str,
        outcome: Result<Submission, ControlPlaneError>,
    ) -> Result<(), TeardownError> {
        let completed = match outcome {
            Ok(submission) => {
                JobWaiter::new(self.client)
                    .with_interval(self.poll_interval)
                    .complete(submission)
                    .await
            }
            Err(err) => Err(err),
        };
        match completed {
            Ok(_) => {
                info!(target_id = target, "{action}");
                report.removed(action, target);
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                report.already_removed(action, target);
                Ok(())
            }
            Err(err) => Err(api_error(action, target, err)),
        }
    }
}

fn api_error(action: &'static str, target: &str, source: ControlPlaneError) -> TeardownError {
    TeardownError::ApiCommand {
        action,
        target: target.to_owned(),
        source,
    }
}
