//! Readiness and guest-communication waits.

use tokio::time::sleep;
use tracing::{debug, info};

use super::prepare::Prepared;
use super::{ProvisionError, ProvisionOrchestrator};
use crate::config::InstanceConfig;
use crate::control_plane::{ControlPlane, InstanceRecord, ListFilter};
use crate::handle::ResourceKind;
use crate::ledger::{LedgerKey, LedgerStore};
use crate::port_allocator::PortSource;
use crate::probe::{GuestEndpoint, GuestProbe};
use crate::resolver::Resolver;

const DATA_DISK_TYPE: &str = "DATADISK";

impl<C, S, G, P> ProvisionOrchestrator<'_, C, S, G, P>
where
    C: ControlPlane + ?Sized,
    S: LedgerStore,
    G: GuestProbe + ?Sized,
    P: PortSource,
{
    /// Polls until the instance reports `Running`.
    ///
    /// Returns `None` when interruption is observed. The number of polls is
    /// bounded by [`InstanceConfig::ready_attempts`].
    pub(super) async fn wait_until_running(
        &self,
        config: &InstanceConfig,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, ProvisionError> {
        let attempts = config.ready_attempts();
        for attempt in 1..=attempts {
            if self.interrupt.is_triggered() {
                return Ok(None);
            }
            let instance = self
                .client
                .get_instance(instance_id)
                .await
                .map_err(|err| ProvisionError::api("query instance", instance_id, err))?
                .ok_or_else(|| ProvisionError::InstanceMissing {
                    instance_id: instance_id.to_owned(),
                })?;
            if instance.is_running() {
                info!(instance_id, attempt, "instance running");
                return Ok(Some(instance));
            }
            debug!(instance_id, attempt, attempts, state = %instance.state, "instance not ready");
            if attempt < attempts {
                sleep(self.poll_interval).await;
            }
        }
        Err(ProvisionError::ReadinessTimeout {
            instance_id: instance_id.to_owned(),
            timeout_secs: config.instance_ready_timeout,
        })
    }

    /// Records the data volumes attached to the instance.
    pub(super) async fn record_volumes(
        &self,
        instance_id: &str,
        prepared: &Prepared,
    ) -> Result<(), ProvisionError> {
        let filter: ListFilter =
            Resolver::<C>::default_filter(ResourceKind::Volume, prepared.zone_id())
                .with("virtualmachineid", instance_id)
                .with("type", DATA_DISK_TYPE);
        let volumes = self
            .client
            .list_resources(ResourceKind::Volume, &filter)
            .await
            .map_err(|err| ProvisionError::api("list volumes of", instance_id, err))?;
        let known = self.ledger.entries(LedgerKey::Volumes)?;
        for volume in volumes.iter().filter(|volume| !known.contains(&volume.id)) {
            self.ledger.record(LedgerKey::Volumes, &volume.id)?;
            debug!(instance_id, volume_id = %volume.id, "recorded data volume");
        }
        Ok(())
    }

    /// Polls the guest probe until it answers. Returns `false` when
    /// interruption is observed first.
    pub(super) async fn wait_for_guest(&self, endpoint: &GuestEndpoint) -> bool {
        loop {
            if self.interrupt.is_triggered() {
                return false;
            }
            if self.probe.is_reachable(endpoint).await {
                info!(endpoint = %endpoint, "guest reachable");
                return true;
            }
            debug!(endpoint = %endpoint, "guest not reachable yet");
            sleep(self.poll_interval).await;
        }
    }
}
