//! Shared fixtures for provisioning BDD scenarios.

use rstest::fixture;
use stratus::ledger::MemoryLedgerStore;
use stratus::test_support::{FakeControlPlane, ScriptedProbe};
use stratus::{InstanceConfig, Ledger, TeardownReport};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct ProvisionContext {
    pub client: FakeControlPlane,
    pub ledger: Ledger<MemoryLedgerStore>,
    pub probe: ScriptedProbe,
    pub config: InstanceConfig,
    pub outcome: Option<ProvisionResult>,
    pub teardowns: Vec<TeardownRun>,
}

#[derive(Clone, Debug)]
pub enum ProvisionResult {
    Ready { warnings: Vec<String> },
    Failure(String),
}

/// One teardown together with the control-plane calls it made.
#[derive(Clone, Debug)]
pub struct TeardownRun {
    pub report: TeardownReport,
    pub calls: usize,
}

#[derive(Clone, Debug, Error)]
pub enum ProvisionTestError {
    #[error("invalid provision fixture: {0}")]
    Fixture(String),
}

pub type ProvisionContextResult = Result<ProvisionContext, ProvisionTestError>;

#[fixture]
pub fn provision_context_result() -> ProvisionContextResult {
    build_provision_context()
}

#[fixture]
pub fn provision_context(provision_context_result: ProvisionContextResult) -> ProvisionContext {
    provision_context_result
        .unwrap_or_else(|err| panic!("provision context fixture should initialise: {err}"))
}

fn build_provision_context() -> ProvisionContextResult {
    let config = InstanceConfig {
        zone_name: Some(String::from("zone-a")),
        service_offering_name: Some(String::from("small")),
        image: Some(String::from("ubuntu")),
        instance_ready_timeout: 4,
        expunge_on_destroy: true,
        ..InstanceConfig::default()
    };
    config
        .validate()
        .map_err(|err| ProvisionTestError::Fixture(err.to_string()))?;

    Ok(ProvisionContext {
        client: FakeControlPlane::with_catalog("Advanced", false),
        ledger: Ledger::new(MemoryLedgerStore::new()),
        probe: ScriptedProbe::reachable(),
        config,
        outcome: None,
        teardowns: Vec::new(),
    })
}
