//! Conflict-tolerant allocation of public ports for forwarding rules.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PortRange;
use crate::control_plane::{ControlPlane, ControlPlaneError, PortForwardingRequest};
use crate::interrupt::Interrupt;
use crate::job::{JOB_POLL_INTERVAL, JobWaiter};
use crate::ledger::{Ledger, LedgerError, LedgerStore};
use crate::rules::Channel;

/// Creation attempts made before allocation gives up.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 10;

const CREATE_COMMAND: &str = "createPortForwardingRule";

/// Source of candidate public ports.
pub trait PortSource: Send {
    /// Draws a port from the half-open `range`.
    fn next_port(&mut self, range: PortRange) -> u16;
}

impl<P: PortSource + ?Sized> PortSource for &mut P {
    fn next_port(&mut self, range: PortRange) -> u16 {
        (**self).next_port(range)
    }
}

/// Uniform draws from the thread-local generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomPorts;

impl PortSource for RandomPorts {
    fn next_port(&mut self, range: PortRange) -> u16 {
        rand::rng().random_range(range.as_range())
    }
}

/// Uniform draws from a caller-supplied generator, for example a seeded
/// `StdRng`.
#[derive(Clone, Debug)]
pub struct RngPorts<R>(pub R);

impl<R: Rng + Send> PortSource for RngPorts<R> {
    fn next_port(&mut self, range: PortRange) -> u16 {
        self.0.random_range(range.as_range())
    }
}

/// Errors raised while allocating a public port.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Every drawn port collided with an existing rule.
    #[error(
        "no free public port in [{start}, {end}) after {attempts} attempts; \
         widen pf_public_port_randomrange or set pf_public_port"
    )]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// First port of the range.
        start: u16,
        /// End of the range.
        end: u16,
    },
    /// Neither a fixed port nor a random range was available.
    #[error("no public port configured and no random range available")]
    NoPortSource,
    /// The control plane rejected the rule for a reason other than a
    /// range conflict.
    #[error("failed to forward public port {port}: {source}")]
    Create {
        /// Port that was requested.
        port: u16,
        /// Underlying control-plane error.
        source: ControlPlaneError,
    },
    /// Persisting the chosen port failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Forwarding rule waiting for its public port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleTemplate {
    /// Public IP address identifier.
    pub ip_address_id: String,
    /// Transport protocol.
    pub protocol: String,
    /// Fixed public port; `None` draws one from the range.
    pub public_port: Option<u16>,
    /// Private port on the instance.
    pub private_port: u16,
    /// `openfirewall` flag, omitted for VPC tiers.
    pub open_firewall: Option<bool>,
    /// Target instance.
    pub virtual_machine_id: String,
    /// Network of the target NIC.
    pub network_id: Option<String>,
}

impl RuleTemplate {
    fn request(&self, public_port: u16) -> PortForwardingRequest {
        PortForwardingRequest {
            ip_address_id: self.ip_address_id.clone(),
            protocol: self.protocol.clone(),
            public_port,
            private_port: self.private_port,
            open_firewall: self.open_firewall,
            virtual_machine_id: self.virtual_machine_id.clone(),
            network_id: self.network_id.clone(),
        }
    }
}

/// Rule created by the allocator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocatedPort {
    /// Public port the rule listens on.
    pub public_port: u16,
    /// Identifier of the created rule.
    pub rule_id: String,
    /// Creation attempts used.
    pub attempts: u32,
}

/// Creates forwarding rules, drawing public ports until one is free.
pub struct PortAllocator<'a, C: ?Sized, S, P> {
    client: &'a C,
    ledger: &'a Ledger<S>,
    source: P,
    poll_interval: Duration,
    interrupt: Option<Interrupt>,
}

impl<'a, C, S, P> PortAllocator<'a, C, S, P>
where
    C: ControlPlane + ?Sized,
    S: LedgerStore,
    P: PortSource,
{
    /// Creates an allocator drawing ports from `source`.
    #[must_use]
    pub const fn new(client: &'a C, ledger: &'a Ledger<S>, source: P) -> Self {
        Self {
            client,
            ledger,
            source,
            poll_interval: JOB_POLL_INTERVAL,
            interrupt: None,
        }
    }

    /// Overrides the job polling interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Abandons pending rule jobs once `interrupt` is triggered.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Creates the rule described by `template`.
    ///
    /// A fixed public port is used as-is. Otherwise a port persisted under
    /// `persist_key` by an earlier run is reused, and failing that ports are
    /// drawn from `range` until creation succeeds, retrying only on range
    /// conflicts. A drawn port is persisted under `persist_key` as soon as
    /// its rule exists.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Exhausted`] after
    /// [`MAX_ALLOCATION_ATTEMPTS`] conflicts, [`AllocationError::Create`]
    /// for any other control-plane failure, and
    /// [`AllocationError::NoPortSource`] when there is nothing to draw from.
    pub async fn allocate_and_create(
        &mut self,
        template: &RuleTemplate,
        range: Option<PortRange>,
        persist_key: Option<Channel>,
    ) -> Result<AllocatedPort, AllocationError> {
        if let Some(port) = template.public_port {
            return self.create_once(template, port).await;
        }
        if let Some(channel) = persist_key
            && let Some(port) = self.ledger.public_port(channel)?
        {
            debug!(port, ?channel, "reusing persisted public port");
            return self.create_once(template, port).await;
        }

        let candidates = range
            .filter(|candidate| !candidate.is_empty())
            .ok_or(AllocationError::NoPortSource)?;
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let port = self.source.next_port(candidates);
            match self.create(template, port).await {
                Ok(rule_id) => {
                    if let Some(channel) = persist_key {
                        self.ledger.record_public_port(channel, port)?;
                    }
                    debug!(port, attempt, rule_id = %rule_id, "allocated public port");
                    return Ok(AllocatedPort {
                        public_port: port,
                        rule_id,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_range_conflict() => {
                    warn!(port, attempt, "public port conflicts with an existing rule");
                }
                Err(source) => return Err(AllocationError::Create { port, source }),
            }
        }

        Err(AllocationError::Exhausted {
            attempts: MAX_ALLOCATION_ATTEMPTS,
            start: candidates.start,
            end: candidates.end,
        })
    }

    async fn create_once(
        &self,
        template: &RuleTemplate,
        port: u16,
    ) -> Result<AllocatedPort, AllocationError> {
        let rule_id = self
            .create(template, port)
            .await
            .map_err(|source| AllocationError::Create { port, source })?;
        Ok(AllocatedPort {
            public_port: port,
            rule_id,
            attempts: 1,
        })
    }

    async fn create(&self, template: &RuleTemplate, port: u16) -> Result<String, ControlPlaneError> {
        let request = template.request(port);
        let submission = self.client.create_port_forwarding_rule(&request).await?;
        let mut waiter = JobWaiter::new(self.client).with_interval(self.poll_interval);
        if let Some(interrupt) = &self.interrupt {
            waiter = waiter.with_interrupt(interrupt.clone());
        }
        waiter.complete(submission).await?.into_id(CREATE_COMMAND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerStore;
    use crate::test_support::{FakeControlPlane, SequencePorts};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::{fixture, rstest};

    #[fixture]
    fn template() -> RuleTemplate {
        RuleTemplate {
            ip_address_id: String::from("ip-1"),
            protocol: String::from("tcp"),
            public_port: None,
            private_port: 22,
            open_firewall: Some(true),
            virtual_machine_id: String::from("vm-1"),
            network_id: None,
        }
    }

    fn ledger() -> Ledger<MemoryLedgerStore> {
        Ledger::new(MemoryLedgerStore::new())
    }

    #[rstest]
    #[tokio::test]
    async fn fixed_port_skips_the_range(template: RuleTemplate) {
        let client = FakeControlPlane::new();
        let ledger = ledger();
        let fixed = RuleTemplate {
            public_port: Some(2222),
            ..template
        };
        let mut allocator = PortAllocator::new(&client, &ledger, SequencePorts::new([]));

        let allocated = allocator
            .allocate_and_create(&fixed, Some(PortRange::new(1, 3)), Some(Channel::Ssh))
            .await
            .unwrap_or_else(|err| panic!("fixed port: {err}"));

        assert_eq!(allocated.public_port, 2222);
        assert_eq!(ledger.public_port(Channel::Ssh), Ok(None));
    }

    #[rstest]
    #[tokio::test]
    async fn persisted_port_is_reused(template: RuleTemplate) {
        let client = FakeControlPlane::new();
        let ledger = ledger();
        ledger
            .record_public_port(Channel::Ssh, 50_001)
            .unwrap_or_else(|err| panic!("seed port: {err}"));
        let mut allocator = PortAllocator::new(&client, &ledger, SequencePorts::new([]));

        let allocated = allocator
            .allocate_and_create(&template, Some(PortRange::default()), Some(Channel::Ssh))
            .await
            .unwrap_or_else(|err| panic!("reuse: {err}"));

        assert_eq!(allocated.public_port, 50_001);
        assert_eq!(client.forwarded_ports(), vec![50_001]);
    }

    #[rstest]
    #[tokio::test]
    async fn other_errors_abort_without_retry(template: RuleTemplate) {
        let client = FakeControlPlane::new();
        client.fail_port_forwarding("ip address is not allocated");
        let ledger = ledger();
        let mut allocator = PortAllocator::new(&client, &ledger, SequencePorts::new([7, 8]));

        let err = allocator
            .allocate_and_create(&template, Some(PortRange::new(1, 100)), Some(Channel::Ssh))
            .await
            .expect_err("non-conflict error should abort");

        assert!(matches!(err, AllocationError::Create { port: 7, .. }));
        assert_eq!(client.forwarded_ports(), vec![7]);
    }

    #[rstest]
    #[tokio::test]
    async fn interrupted_rule_job_is_not_retried(template: RuleTemplate) {
        let client = FakeControlPlane::new();
        client.set_pending_job_polls(300);
        let ledger = ledger();
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let mut allocator = PortAllocator::new(&client, &ledger, SequencePorts::new([7, 8]))
            .with_poll_interval(Duration::from_millis(1))
            .with_interrupt(interrupt);

        let err = allocator
            .allocate_and_create(&template, Some(PortRange::new(1, 100)), Some(Channel::Ssh))
            .await
            .expect_err("interrupted wait should abort");

        assert!(matches!(
            err,
            AllocationError::Create { port: 7, ref source } if source.is_interrupted()
        ));
        assert_eq!(client.forwarded_ports(), vec![7]);
        assert_eq!(client.total_job_queries(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn seeded_generator_stays_in_range(template: RuleTemplate) {
        let client = FakeControlPlane::new();
        let ledger = ledger();
        let mut allocator =
            PortAllocator::new(&client, &ledger, RngPorts(StdRng::seed_from_u64(7)));

        let allocated = allocator
            .allocate_and_create(&template, Some(PortRange::new(40_000, 40_010)), None)
            .await
            .unwrap_or_else(|err| panic!("allocate: {err}"));

        assert!((40_000..40_010).contains(&allocated.public_port));
    }

    #[rstest]
    #[tokio::test]
    async fn missing_range_is_reported(template: RuleTemplate) {
        let client = FakeControlPlane::new();
        let ledger = ledger();
        let mut allocator = PortAllocator::new(&client, &ledger, RandomPorts);

        let err = allocator
            .allocate_and_create(&template, None, Some(Channel::Ssh))
            .await
            .expect_err("no source");

        assert!(matches!(err, AllocationError::NoPortSource));
        assert!(client.calls().is_empty());
    }
}
