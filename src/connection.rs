//! Read-back of the details needed to connect to a provisioned instance.

use thiserror::Error;
use tracing::debug;

use crate::config::InstanceConfig;
use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::handle::ResourceKind;
use crate::ledger::{Ledger, LedgerError, LedgerStore};
use crate::resolver::{ResolveError, Resolver};
use crate::rules::{Channel, NetworkPlan};

/// Errors raised while reading connection details.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The ledger could not be read.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// The forwarding IP could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// Querying the instance failed.
    #[error("failed to query instance {instance_id}: {source}")]
    Query {
        /// Instance recorded in the ledger.
        instance_id: String,
        /// Underlying control-plane error.
        source: ControlPlaneError,
    },
}

/// Where and as whom to reach a provisioned guest.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionInfo {
    /// Instance the details belong to.
    pub instance_id: String,
    /// Forwarding IP address, or the instance address without forwarding.
    /// `None` when the instance has vanished and nothing is forwarded.
    pub host: Option<String>,
    /// Public port when one is fixed or recorded, private port otherwise.
    pub port: u16,
    /// PEM private key of a generated key pair.
    pub private_key: Option<String>,
    /// Name of the generated key pair.
    pub key_pair_name: Option<String>,
    /// Password generated by the control plane.
    pub password: Option<String>,
    /// Configured guest user.
    pub user: Option<String>,
}

/// Reads connection details for the instance recorded in `ledger`.
///
/// Returns `None` when no instance is recorded.
///
/// # Errors
///
/// Returns [`ConnectionError`] when the ledger cannot be read, the
/// forwarding IP cannot be resolved, or the instance query fails.
pub async fn read_connection_info<C, S>(
    client: &C,
    ledger: &Ledger<S>,
    config: &InstanceConfig,
) -> Result<Option<ConnectionInfo>, ConnectionError>
where
    C: ControlPlane + ?Sized,
    S: LedgerStore,
{
    let Some(instance_id) = ledger.instance_id()? else {
        return Ok(None);
    };

    let channel = Channel::for_family(config.guest);
    let plan = NetworkPlan::new(&config.network, config.communicator);
    let public_port = plan
        .public_port(channel)
        .map_or_else(|| ledger.public_port(channel), |port| Ok(Some(port)))?;

    let forwarding = plan.forwarding_ip();
    let forwarding_host = if forwarding.is_undefined() {
        None
    } else {
        let filter = Resolver::<C>::default_filter(ResourceKind::PublicIpAddress, None);
        let ip = Resolver::new(client).resolve(&forwarding, &filter).await?;
        ip.name().map(str::to_owned)
    };

    let (host, port) = match (forwarding_host, public_port) {
        (Some(address), Some(port)) => (Some(address), port),
        _ => {
            let instance = client
                .get_instance(&instance_id)
                .await
                .map_err(|source| ConnectionError::Query {
                    instance_id: instance_id.clone(),
                    source,
                })?;
            (
                instance.and_then(|record| record.ip_address),
                plan.private_port(channel),
            )
        }
    };

    let key_pair = ledger.ssh_key_pair()?;
    let info = ConnectionInfo {
        instance_id,
        host,
        port,
        key_pair_name: key_pair.as_ref().map(|pair| pair.name.clone()),
        private_key: key_pair.map(|pair| pair.private_key),
        password: ledger.credentials()?,
        user: config.vm_user.clone(),
    };
    debug!(instance_id = %info.instance_id, port = info.port, "read connection info");
    Ok(Some(info))
}
