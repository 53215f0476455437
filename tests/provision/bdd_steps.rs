//! BDD step definitions for provisioning and teardown.

use std::time::Duration;

use rstest_bdd_macros::{given, then, when};
use stratus::config::{SecurityGroupRuleSpec, SecurityGroupSpec};
use stratus::control_plane::Direction;
use stratus::test_support::{FakeControlPlane, SequencePorts};
use stratus::{LedgerKey, ProvisionOrchestrator, ProvisionStatus, TeardownOrchestrator};
use tokio::runtime::Runtime;

use super::test_helpers::{ProvisionContext, ProvisionResult, TeardownRun};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a zone using \"{network_type}\" networking")]
fn zone_networking(
    mut provision_context: ProvisionContext,
    network_type: String,
) -> ProvisionContext {
    provision_context.client = FakeControlPlane::with_catalog(&network_type, false);
    provision_context
}

#[given("a zone with security groups using \"{network_type}\" networking")]
fn zone_with_security_groups(
    mut provision_context: ProvisionContext,
    network_type: String,
) -> ProvisionContext {
    provision_context.client = FakeControlPlane::with_catalog(&network_type, true);
    provision_context
}

#[given("the configuration forwards through network \"{network}\" and IP \"{address}\"")]
fn forwards_through(
    mut provision_context: ProvisionContext,
    network: String,
    address: String,
) -> ProvisionContext {
    provision_context.config.network.network_name = Some(network);
    provision_context.config.network.pf_ip_address = Some(address);
    provision_context
}

#[given("the configuration creates security group \"{name}\"")]
fn creates_security_group(
    mut provision_context: ProvisionContext,
    name: String,
) -> ProvisionContext {
    provision_context.config.security_groups.push(SecurityGroupSpec {
        name,
        description: None,
        rules: vec![SecurityGroupRuleSpec {
            direction: Direction::Ingress,
            protocol: String::from("tcp"),
            cidr_list: None,
            start_port: Some(22),
            end_port: None,
            icmp_type: None,
            icmp_code: None,
        }],
    });
    provision_context
}

#[given("the instance never becomes ready")]
fn never_ready(provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.client.never_ready();
    provision_context
}

#[when("I provision the instance")]
fn provision_instance(
    mut provision_context: ProvisionContext,
) -> Result<ProvisionContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let result = runtime.block_on(async {
        ProvisionOrchestrator::new(
            &provision_context.client,
            &provision_context.ledger,
            &provision_context.probe,
        )
        .with_port_source(SequencePorts::new([50_001]))
        .with_poll_interval(POLL_INTERVAL)
        .provision(&provision_context.config)
        .await
    });
    let outcome = match result {
        Ok(outcome) if outcome.status == ProvisionStatus::Ready => ProvisionResult::Ready {
            warnings: outcome.warnings,
        },
        Ok(outcome) => ProvisionResult::Failure(format!("unexpected status {:?}", outcome.status)),
        Err(failure) => ProvisionResult::Failure(failure.to_string()),
    };
    provision_context.outcome = Some(outcome);
    Ok(provision_context)
}

#[when("I tear the instance down")]
fn tear_down(mut provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let before = provision_context.client.calls().len();
    let report = runtime
        .block_on(async {
            TeardownOrchestrator::new(&provision_context.client, &provision_context.ledger)
                .with_expunge(provision_context.config.expunge_on_destroy)
                .with_poll_interval(POLL_INTERVAL)
                .with_security_group_retry(POLL_INTERVAL)
                .teardown()
                .await
        })
        .map_err(|err| StepError::Assertion(format!("teardown failed: {err}")))?;
    let calls = provision_context.client.calls().len().saturating_sub(before);
    provision_context.teardowns.push(TeardownRun { report, calls });
    Ok(provision_context)
}

#[then("provisioning succeeds")]
fn provisioning_succeeds(provision_context: &ProvisionContext) -> Result<(), StepError> {
    match provision_context.outcome {
        Some(ProvisionResult::Ready { .. }) => Ok(()),
        Some(ProvisionResult::Failure(ref message)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {message}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("provisioning fails with \"{text}\"")]
fn provisioning_fails(provision_context: &ProvisionContext, text: String) -> Result<(), StepError> {
    let Some(ProvisionResult::Failure(message)) = &provision_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if message.contains(&text) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure mentioning '{text}', got: {message}"
        )))
    }
}

#[then("a warning mentions \"{text}\"")]
fn warning_mentions(provision_context: &ProvisionContext, text: String) -> Result<(), StepError> {
    let Some(ProvisionResult::Ready { warnings }) = &provision_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected successful outcome",
        )));
    };
    if warnings.iter().any(|warning| warning.contains(&text)) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "no warning mentions '{text}': {warnings:?}"
        )))
    }
}

#[then("no port forwarding rule is requested")]
fn no_forwarding(provision_context: &ProvisionContext) -> Result<(), StepError> {
    if provision_context.client.forwarding_requests().is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "port forwarding should not be requested",
        )))
    }
}

#[then("the ledger records \"{count}\" security groups")]
fn ledger_records_groups(
    provision_context: &ProvisionContext,
    count: usize,
) -> Result<(), StepError> {
    let recorded = provision_context
        .ledger
        .entries(LedgerKey::SecurityGroups)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if recorded.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} recorded security groups, got {recorded:?}"
        )))
    }
}

#[then("the ledger is empty")]
fn ledger_empty(provision_context: &ProvisionContext) -> Result<(), StepError> {
    for key in LedgerKey::ALL {
        let entries = provision_context
            .ledger
            .entries(key)
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        if !entries.is_empty() {
            return Err(StepError::Assertion(format!(
                "{} still holds {entries:?}",
                key.as_str()
            )));
        }
    }
    Ok(())
}

#[then("no security group remains")]
fn no_security_group(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let groups = provision_context.client.security_groups();
    if groups.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "security groups left behind: {groups:?}"
        )))
    }
}

#[then("the instance is destroyed")]
fn instance_destroyed(provision_context: &ProvisionContext) -> Result<(), StepError> {
    if provision_context.client.destroy_requests().is_empty() {
        Err(StepError::Assertion(String::from(
            "the instance should be destroyed",
        )))
    } else {
        Ok(())
    }
}

#[then("the last teardown makes no control-plane calls")]
fn last_teardown_idle(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let Some(last) = provision_context.teardowns.last() else {
        return Err(StepError::Assertion(String::from("no teardown ran")));
    };
    if last.calls == 0 && last.report.nothing_to_destroy {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected an idle teardown, got {} calls and {:?}",
            last.calls, last.report
        )))
    }
}
