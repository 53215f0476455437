//! Provisioning and teardown of control-plane instances.
//!
//! The crate creates an instance together with its networking side
//! effects (security groups, key pairs, static NAT, port forwarding and
//! firewall rules), records every created resource in a ledger, and later
//! releases exactly what the ledger names:
//!
//! resolve → create → wait for `Running` → configure network → wait for
//! the guest → teardown.

pub mod config;
pub mod connection;
pub mod control_plane;
pub mod handle;
pub mod interrupt;
pub mod job;
pub mod ledger;
pub mod port_allocator;
pub mod probe;
pub mod provision;
pub mod resolver;
pub mod rules;
pub mod teardown;
pub mod test_support;

pub use config::{ConfigError, InstanceConfig, NetworkConfig, OrchestratorSettings, PortRange};
pub use connection::{ConnectionError, ConnectionInfo, read_connection_info};
pub use control_plane::{ControlPlane, ControlPlaneError, ControlPlaneFuture};
pub use handle::{ResourceHandle, ResourceKind};
pub use interrupt::Interrupt;
pub use ledger::{FileLedgerStore, Ledger, LedgerError, LedgerKey, LedgerStore, MemoryLedgerStore};
pub use port_allocator::{AllocationError, PortAllocator, PortSource, RandomPorts};
pub use probe::{GuestEndpoint, GuestProbe, TcpProbe};
pub use provision::{
    ProvisionError, ProvisionOrchestrator, ProvisionOutcome, ProvisionStage, ProvisionStatus,
};
pub use resolver::{ResolveError, Resolver};
pub use teardown::{TeardownError, TeardownOrchestrator, TeardownReport};
