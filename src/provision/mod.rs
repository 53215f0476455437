//! Instance provisioning state machine.
//!
//! The orchestrator walks `Resolving → ClassifyingZone →
//! PreparingSecurityGroups → Creating → WaitingReady → ConfiguringNetwork →
//! WaitingGuestCommunication → Done`. Every side effect is written to the
//! [`Ledger`] as soon as it exists. Once the instance id is recorded, any
//! failure or interruption tears everything down before returning.

mod error;
mod network;
mod prepare;
mod wait;

use std::fmt;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{InstanceConfig, OrchestratorSettings};
use crate::control_plane::{ControlPlane, ControlPlaneError, Submission};
use crate::interrupt::Interrupt;
use crate::job::{Completed, JOB_POLL_INTERVAL, JobWaiter};
use crate::ledger::{Ledger, LedgerStore};
use crate::port_allocator::{PortSource, RandomPorts};
use crate::probe::{GuestEndpoint, GuestProbe};
use crate::teardown::{SECURITY_GROUP_RETRY_BACKOFF, TeardownOrchestrator, TeardownReport};

pub use error::ProvisionError;

/// States of the provisioning state machine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProvisionStage {
    /// Resolving zone, offerings and template.
    Resolving,
    /// Reading the zone's network type and resolving the network.
    ClassifyingZone,
    /// Resolving or creating security groups and the key pair.
    PreparingSecurityGroups,
    /// Submitting the create-instance request.
    Creating,
    /// Waiting for the instance to report `Running`.
    WaitingReady,
    /// Creating static NAT, forwarding and firewall rules.
    ConfiguringNetwork,
    /// Waiting for the guest to accept connections.
    WaitingGuestCommunication,
    /// Provisioning finished.
    Done,
    /// Interruption observed; tearing down.
    Terminating,
}

impl ProvisionStage {
    /// Stable label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::ClassifyingZone => "classifying_zone",
            Self::PreparingSecurityGroups => "preparing_security_groups",
            Self::Creating => "creating",
            Self::WaitingReady => "waiting_ready",
            Self::ConfiguringNetwork => "configuring_network",
            Self::WaitingGuestCommunication => "waiting_guest_communication",
            Self::Done => "done",
            Self::Terminating => "terminating",
        }
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a provisioning run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProvisionStatus {
    /// The instance is running and the guest answers.
    Ready,
    /// Interruption was requested; everything created was torn down.
    Interrupted,
}

/// Result of a provisioning run that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionOutcome {
    /// Instance identifier, absent when interrupted before creation.
    pub instance_id: Option<String>,
    /// Final status.
    pub status: ProvisionStatus,
    /// Endpoint the guest was reached on.
    pub endpoint: Option<GuestEndpoint>,
    /// Stages entered, in order.
    pub stages: Vec<ProvisionStage>,
    /// Warnings for the caller, such as discarded configuration.
    pub warnings: Vec<String>,
    /// Teardown report when the run was interrupted.
    pub teardown: Option<TeardownReport>,
}

/// Stage trail and warnings collected during one run.
#[derive(Debug, Default)]
struct Progress {
    stages: Vec<ProvisionStage>,
    warnings: Vec<String>,
}

impl Progress {
    fn enter(&mut self, stage: ProvisionStage) {
        info!(stage = %stage, "provision stage");
        self.stages.push(stage);
    }

    fn warn(&mut self, message: String) {
        warn!(%message, "provision warning");
        self.warnings.push(message);
    }

    fn finish(
        self,
        instance_id: Option<String>,
        status: ProvisionStatus,
        endpoint: Option<GuestEndpoint>,
        teardown: Option<TeardownReport>,
    ) -> ProvisionOutcome {
        ProvisionOutcome {
            instance_id,
            status,
            endpoint,
            stages: self.stages,
            warnings: self.warnings,
            teardown,
        }
    }
}

/// Provisions one instance and records every side effect in a ledger.
#[derive(Debug)]
pub struct ProvisionOrchestrator<'a, C: ?Sized, S, G: ?Sized, P = RandomPorts> {
    client: &'a C,
    ledger: &'a Ledger<S>,
    probe: &'a G,
    ports: P,
    interrupt: Interrupt,
    poll_interval: Duration,
    security_group_retry: Duration,
}

impl<'a, C, S, G> ProvisionOrchestrator<'a, C, S, G, RandomPorts>
where
    C: ControlPlane + ?Sized,
    S: LedgerStore,
    G: GuestProbe + ?Sized,
{
    /// Creates an orchestrator drawing public ports at random.
    #[must_use]
    pub fn new(client: &'a C, ledger: &'a Ledger<S>, probe: &'a G) -> Self {
        Self {
            client,
            ledger,
            probe,
            ports: RandomPorts,
            interrupt: Interrupt::new(),
            poll_interval: JOB_POLL_INTERVAL,
            security_group_retry: SECURITY_GROUP_RETRY_BACKOFF,
        }
    }
}

impl<'a, C, S, G, P> ProvisionOrchestrator<'a, C, S, G, P>
where
    C: ControlPlane + ?Sized,
    S: LedgerStore,
    G: GuestProbe + ?Sized,
    P: PortSource,
{
    /// Replaces the source of random public ports.
    #[must_use]
    pub fn with_port_source<Q: PortSource>(
        self,
        ports: Q,
    ) -> ProvisionOrchestrator<'a, C, S, G, Q> {
        ProvisionOrchestrator {
            client: self.client,
            ledger: self.ledger,
            probe: self.probe,
            ports,
            interrupt: self.interrupt,
            poll_interval: self.poll_interval,
            security_group_retry: self.security_group_retry,
        }
    }

    /// Observes `interrupt` at every poll and stage transition.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Overrides the interval between job, readiness and guest polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Applies process-wide settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: &OrchestratorSettings) -> Self {
        self.poll_interval = settings.poll_interval();
        self.security_group_retry = settings.security_group_retry();
        self
    }

    /// Provisions the instance described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Config`] or [`ProvisionError::Resolve`]
    /// before anything is created. Later failures are returned after the
    /// created resources were torn down, or as
    /// [`ProvisionError::TeardownFailed`] when that also failed.
    pub async fn provision(
        &mut self,
        config: &InstanceConfig,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        config.validate()?;
        let mut progress = Progress::default();

        let prepared = match self.prepare(config, &mut progress).await {
            Ok(prepared) => prepared,
            Err(err) if err.is_interrupted() => {
                return self.interrupted_before_create(config, progress).await;
            }
            Err(err) => return Err(self.release_after(config, err).await),
        };

        progress.enter(ProvisionStage::Creating);
        if self.interrupt.is_triggered() {
            return self.interrupted_before_create(config, progress).await;
        }
        let created = match self.create_instance(config, &prepared).await {
            Ok(created) => created,
            Err(err) => {
                return match (self.ledger.instance_id(), err.is_interrupted()) {
                    (Ok(Some(instance_id)), true) => {
                        self.terminate(config, instance_id, progress).await
                    }
                    (Ok(Some(_)), false) => Err(self.teardown_after(config, err).await),
                    (_, true) => self.interrupted_before_create(config, progress).await,
                    (_, false) => Err(self.release_after(config, err).await),
                };
            }
        };

        match self
            .after_create(config, &prepared, &created, &mut progress)
            .await
        {
            Ok(Some(endpoint)) => {
                progress.enter(ProvisionStage::Done);
                info!(instance_id = %created.instance_id, endpoint = %endpoint, "instance ready");
                Ok(progress.finish(
                    Some(created.instance_id),
                    ProvisionStatus::Ready,
                    Some(endpoint),
                    None,
                ))
            }
            Ok(None) => self.terminate(config, created.instance_id, progress).await,
            Err(err) if err.is_interrupted() => {
                self.terminate(config, created.instance_id, progress).await
            }
            Err(err) => Err(self.teardown_after(config, err).await),
        }
    }

    /// Runs the stages that follow a successful create call. `None` means
    /// interruption was observed.
    async fn after_create(
        &mut self,
        config: &InstanceConfig,
        prepared: &prepare::Prepared,
        created: &prepare::Created,
        progress: &mut Progress,
    ) -> Result<Option<GuestEndpoint>, ProvisionError> {
        progress.enter(ProvisionStage::WaitingReady);
        let Some(instance) = self.wait_until_running(config, &created.instance_id).await? else {
            return Ok(None);
        };
        self.record_volumes(&created.instance_id, prepared).await?;

        if self.interrupt.is_triggered() {
            return Ok(None);
        }
        progress.enter(ProvisionStage::ConfiguringNetwork);
        let network = self
            .configure_network(config, prepared, &created.instance_id, progress)
            .await?;

        if self.interrupt.is_triggered() {
            return Ok(None);
        }
        progress.enter(ProvisionStage::WaitingGuestCommunication);
        let endpoint = network.guest_endpoint(&instance).ok_or_else(|| {
            ProvisionError::NoGuestAddress {
                instance_id: created.instance_id.clone(),
            }
        })?;
        let reached = self.wait_for_guest(&endpoint).await;
        Ok(reached.then_some(endpoint))
    }

    /// Awaits the job of a submission, if any, abandoning the wait when
    /// interruption is requested.
    async fn complete(
        &self,
        submitted: Result<Submission, ControlPlaneError>,
    ) -> Result<Completed, ControlPlaneError> {
        JobWaiter::new(self.client)
            .with_interval(self.poll_interval)
            .with_interrupt(self.interrupt.clone())
            .complete(submitted?)
            .await
    }

    fn teardown_orchestrator(&self, config: &InstanceConfig) -> TeardownOrchestrator<'a, C, S> {
        TeardownOrchestrator::new(self.client, self.ledger)
            .with_expunge(config.expunge_on_destroy)
            .with_poll_interval(self.poll_interval)
            .with_security_group_retry(self.security_group_retry)
    }

    async fn terminate(
        &self,
        config: &InstanceConfig,
        instance_id: String,
        mut progress: Progress,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        progress.enter(ProvisionStage::Terminating);
        warn!(instance_id = %instance_id, "interrupted; tearing down");
        let report = self.teardown_orchestrator(config).teardown().await?;
        Ok(progress.finish(
            Some(instance_id),
            ProvisionStatus::Interrupted,
            None,
            Some(report),
        ))
    }

    async fn interrupted_before_create(
        &self,
        config: &InstanceConfig,
        mut progress: Progress,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        progress.enter(ProvisionStage::Terminating);
        warn!("interrupted before the instance was created");
        let report = self.teardown_orchestrator(config).release_unbound().await?;
        Ok(progress.finish(None, ProvisionStatus::Interrupted, None, Some(report)))
    }

    async fn teardown_after(&self, config: &InstanceConfig, err: ProvisionError) -> ProvisionError {
        warn!(error = %err, "provisioning failed; tearing down");
        match self.teardown_orchestrator(config).teardown().await {
            Ok(_) => err,
            Err(teardown) => ProvisionError::TeardownFailed {
                original: Box::new(err),
                teardown: Box::new(teardown),
            },
        }
    }

    async fn release_after(&self, config: &InstanceConfig, err: ProvisionError) -> ProvisionError {
        match self.teardown_orchestrator(config).release_unbound().await {
            Ok(report) => {
                if !report.removed.is_empty() {
                    warn!(
                        error = %err,
                        released = report.removed.len(),
                        "released resources after failure"
                    );
                }
                err
            }
            Err(teardown) => ProvisionError::TeardownFailed {
                original: Box::new(err),
                teardown: Box::new(teardown),
            },
        }
    }
}

#[cfg(test)]
mod tests;
