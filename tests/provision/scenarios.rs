//! BDD scenarios for the provisioning lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{
    ProvisionContext, ProvisionContextResult, provision_context, provision_context_result,
};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Basic zones drop requested networking"
)]
fn scenario_basic_zone(
    provision_context_result: ProvisionContextResult,
    provision_context: ProvisionContext,
) {
    drop(provision_context_result);
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Created security groups are recorded and released"
)]
fn scenario_security_groups(
    provision_context_result: ProvisionContextResult,
    provision_context: ProvisionContext,
) {
    drop(provision_context_result);
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "A readiness timeout tears the instance down"
)]
fn scenario_readiness_timeout(
    provision_context_result: ProvisionContextResult,
    provision_context: ProvisionContext,
) {
    drop(provision_context_result);
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Teardown is idempotent"
)]
fn scenario_idempotent_teardown(
    provision_context_result: ProvisionContextResult,
    provision_context: ProvisionContext,
) {
    drop(provision_context_result);
    drop(provision_context);
}
