//! Unit tests for the provisioning state machine.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::config::{GuestFamily, SecurityGroupRuleSpec, SecurityGroupSpec};
use crate::control_plane::Direction;
use crate::ledger::{FirewallRuleKind, LedgerKey, MemoryLedgerStore};
use crate::port_allocator::AllocationError;
use crate::rules::Channel;
use crate::test_support::{FakeControlPlane, ScriptedProbe, SequencePorts};

type TestOrchestrator<'a> =
    ProvisionOrchestrator<'a, FakeControlPlane, MemoryLedgerStore, ScriptedProbe, SequencePorts>;

#[fixture]
fn ledger() -> Ledger<MemoryLedgerStore> {
    Ledger::new(MemoryLedgerStore::new())
}

#[fixture]
fn probe() -> ScriptedProbe {
    ScriptedProbe::reachable()
}

fn base_config() -> InstanceConfig {
    InstanceConfig {
        zone_name: Some(String::from("zone-a")),
        service_offering_name: Some(String::from("small")),
        image: Some(String::from("ubuntu")),
        keypair: Some(String::from("operator")),
        instance_ready_timeout: 4,
        ..InstanceConfig::default()
    }
}

fn forwarded_config(network: &str) -> InstanceConfig {
    let mut config = base_config();
    config.network.network_name = Some(network.to_owned());
    config.network.pf_ip_address = Some(String::from("203.0.113.10"));
    config.network.pf_trusted_networks = vec![String::from("10.0.0.0/8")];
    config.network.pf_open_firewall = false;
    config
}

fn web_group() -> SecurityGroupSpec {
    SecurityGroupSpec {
        name: String::from("web"),
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
    }
}

fn orchestrator<'a>(
    client: &'a FakeControlPlane,
    ledger: &'a Ledger<MemoryLedgerStore>,
    probe: &'a ScriptedProbe,
) -> TestOrchestrator<'a> {
    ProvisionOrchestrator::new(client, ledger, probe)
        .with_port_source(SequencePorts::new([50_001, 50_002]))
        .with_poll_interval(Duration::from_millis(1))
}

#[rstest]
#[tokio::test]
async fn forwards_ssh_and_opens_trusted_firewall(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);

    let outcome = orchestrator(&client, &ledger, &probe)
        .provision(&forwarded_config("guest"))
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert_eq!(outcome.status, ProvisionStatus::Ready);
    assert_eq!(
        outcome.endpoint,
        Some(GuestEndpoint {
            host: String::from("203.0.113.10"),
            port: 50_001,
        })
    );
    assert_eq!(
        outcome.stages,
        vec![
            ProvisionStage::Resolving,
            ProvisionStage::ClassifyingZone,
            ProvisionStage::PreparingSecurityGroups,
            ProvisionStage::Creating,
            ProvisionStage::WaitingReady,
            ProvisionStage::ConfiguringNetwork,
            ProvisionStage::WaitingGuestCommunication,
            ProvisionStage::Done,
        ]
    );

    let forwarding = client.forwarding_requests();
    let rule = forwarding
        .first()
        .unwrap_or_else(|| panic!("a forwarding rule should be requested"));
    assert_eq!((rule.public_port, rule.private_port), (50_001, 22));
    assert_eq!(rule.open_firewall, Some(false));
    assert_eq!(rule.network_id.as_deref(), Some("net-1"));

    let firewall = client.firewall_requests();
    let opened = firewall
        .first()
        .unwrap_or_else(|| panic!("a firewall rule should be requested"));
    assert_eq!(opened.ip_address_id, "ip-1");
    assert_eq!(opened.traffic.cidr_list, "10.0.0.0/8");
    assert_eq!(opened.traffic.start_port, Some(50_001));

    assert_eq!(
        ledger
            .public_port(Channel::Ssh)
            .unwrap_or_else(|err| panic!("read port: {err}")),
        Some(50_001)
    );
    assert_eq!(
        ledger
            .entries(LedgerKey::PortForwarding)
            .unwrap_or_else(|err| panic!("read rules: {err}"))
            .len(),
        1
    );
    assert_eq!(
        ledger
            .instance_id()
            .unwrap_or_else(|err| panic!("read id: {err}")),
        outcome.instance_id
    );
}

#[rstest]
#[tokio::test]
async fn basic_zone_drops_networking_with_warning(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Basic", false);

    let outcome = orchestrator(&client, &ledger, &probe)
        .provision(&forwarded_config("guest"))
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings.iter().any(|warning| warning.contains("basic networking")));
    let deploys = client.deploy_requests();
    let deploy = deploys
        .first()
        .unwrap_or_else(|| panic!("instance should be requested"));
    assert!(deploy.network_ids.is_empty());
    assert!(client.forwarding_requests().is_empty());
    assert!(client.firewall_requests().is_empty());
    assert_eq!(
        outcome.endpoint,
        Some(GuestEndpoint {
            host: String::from("10.1.1.5"),
            port: 22,
        })
    );
}

#[rstest]
#[tokio::test]
async fn vpc_tier_uses_acl_rules(ledger: Ledger<MemoryLedgerStore>, probe: ScriptedProbe) {
    let client = FakeControlPlane::with_catalog("Advanced", false);

    orchestrator(&client, &ledger, &probe)
        .provision(&forwarded_config("tier-web"))
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert!(client.firewall_requests().is_empty());
    let acls = client.acl_requests();
    let acl = acls
        .first()
        .unwrap_or_else(|| panic!("an ACL rule should be requested"));
    assert_eq!(acl.acl_id, "acl-1");
    assert!(
        client
            .forwarding_requests()
            .iter()
            .all(|request| request.open_firewall.is_none())
    );
    let records = ledger
        .firewall_rules()
        .unwrap_or_else(|err| panic!("read firewall: {err}"));
    assert!(
        records
            .iter()
            .all(|record| record.kind == FirewallRuleKind::NetworkAcl)
    );
    assert_eq!(records.len(), 1);
}

#[rstest]
#[tokio::test]
async fn security_group_spec_is_created_and_recorded(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", true);
    let config = InstanceConfig {
        security_groups: vec![web_group()],
        ..base_config()
    };

    orchestrator(&client, &ledger, &probe)
        .provision(&config)
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    let groups = client.security_groups();
    assert_eq!(groups.len(), 1);
    let rules = client.security_group_rule_requests();
    let rule = rules
        .first()
        .unwrap_or_else(|| panic!("a rule should be authorized"));
    assert_eq!(rule.direction, Direction::Ingress);
    assert_eq!(rule.traffic.cidr_list, "0.0.0.0/0");
    assert_eq!((rule.traffic.start_port, rule.traffic.end_port), (Some(22), Some(22)));
    assert_eq!(
        ledger
            .entries(LedgerKey::SecurityGroups)
            .unwrap_or_else(|err| panic!("read groups: {err}")),
        groups
    );
    assert!(
        client
            .deploy_requests()
            .iter()
            .all(|request| request.security_group_ids == groups)
    );
}

#[rstest]
#[tokio::test]
async fn existing_group_is_reused_without_new_rules(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", true);
    client.add_security_group("sg-9", "web");
    let config = InstanceConfig {
        security_groups: vec![web_group()],
        ..base_config()
    };

    orchestrator(&client, &ledger, &probe)
        .provision(&config)
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert!(client.security_group_rule_requests().is_empty());
    assert_eq!(
        ledger
            .entries(LedgerKey::SecurityGroups)
            .unwrap_or_else(|err| panic!("read groups: {err}")),
        vec![String::from("sg-9")]
    );
}

#[rstest]
#[tokio::test]
async fn failed_rule_authorization_releases_created_group(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", true);
    client.fail_security_group_rules("invalid cidr");
    let config = InstanceConfig {
        security_groups: vec![web_group()],
        ..base_config()
    };

    let err = orchestrator(&client, &ledger, &probe)
        .provision(&config)
        .await
        .expect_err("rule authorization should fail");

    assert!(matches!(
        err,
        ProvisionError::ApiCommand {
            action: "authorize security group rule on",
            ..
        }
    ));
    assert_eq!(client.calls_to("createSecurityGroup"), 1);
    assert_eq!(client.calls_to("deleteSecurityGroup"), 1);
    assert!(client.security_groups().is_empty());
    assert!(client.deploy_requests().is_empty());
    assert!(
        ledger
            .entries(LedgerKey::SecurityGroups)
            .unwrap_or_else(|failure| panic!("read groups: {failure}"))
            .is_empty()
    );
}

#[rstest]
#[tokio::test]
async fn group_named_twice_is_attached_once(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", true);
    client.add_security_group("sg-9", "web");
    client.add_security_group("sg-3", "ops");
    let config = InstanceConfig {
        security_group_ids: vec![String::from("sg-9")],
        security_group_names: vec![String::from("ops"), String::from("web")],
        ..base_config()
    };

    orchestrator(&client, &ledger, &probe)
        .provision(&config)
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    let requests = client.deploy_requests();
    let request = requests
        .first()
        .unwrap_or_else(|| panic!("an instance should be deployed"));
    assert_eq!(
        request.security_group_ids,
        vec![String::from("sg-9"), String::from("sg-3")]
    );
    assert!(
        ledger
            .entries(LedgerKey::SecurityGroups)
            .unwrap_or_else(|err| panic!("read groups: {err}"))
            .is_empty()
    );
}

#[rstest]
#[tokio::test]
async fn windows_guest_is_reached_on_forwarded_rdp_port(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    let config = InstanceConfig {
        guest: GuestFamily::Windows,
        ..forwarded_config("guest")
    };

    let outcome = orchestrator(&client, &ledger, &probe)
        .provision(&config)
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    let endpoint = GuestEndpoint {
        host: String::from("203.0.113.10"),
        port: 50_001,
    };
    assert_eq!(outcome.endpoint.as_ref(), Some(&endpoint));
    assert_eq!(probe.attempts().first(), Some(&endpoint));
    let forwarding = client.forwarding_requests();
    let rule = forwarding
        .first()
        .unwrap_or_else(|| panic!("a forwarding rule should be requested"));
    assert_eq!((rule.public_port, rule.private_port), (50_001, 3389));
    assert_eq!(
        ledger
            .public_port(Channel::Rdp)
            .unwrap_or_else(|err| panic!("read port: {err}")),
        Some(50_001)
    );
}

#[rstest]
#[tokio::test]
async fn groups_are_ignored_where_unsupported(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    let config = InstanceConfig {
        security_group_names: vec![String::from("web")],
        ..base_config()
    };

    let outcome = orchestrator(&client, &ledger, &probe)
        .provision(&config)
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert!(
        outcome
            .warnings
            .iter()
            .any(|warning| warning.contains("does not support security groups"))
    );
    assert!(
        client
            .deploy_requests()
            .iter()
            .all(|request| request.security_group_ids.is_empty())
    );
}

#[rstest]
#[tokio::test]
async fn readiness_timeout_tears_instance_down(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    client.never_ready();

    let err = orchestrator(&client, &ledger, &probe)
        .provision(&base_config())
        .await
        .expect_err("instance never runs");

    assert!(matches!(
        err,
        ProvisionError::ReadinessTimeout { timeout_secs: 4, .. }
    ));
    assert_eq!(client.calls_to("getVirtualMachine"), 2);
    assert_eq!(client.destroy_requests().len(), 1);
    assert_eq!(
        ledger
            .instance_id()
            .unwrap_or_else(|failure| panic!("read id: {failure}")),
        None
    );
    assert!(probe.attempts().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_create_releases_generated_key_pair(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    client.fail_create_instance("insufficient capacity");
    let config = InstanceConfig {
        keypair: None,
        ..base_config()
    };

    let err = orchestrator(&client, &ledger, &probe)
        .provision(&config)
        .await
        .expect_err("create should fail");

    assert!(matches!(err, ProvisionError::ApiCommand { .. }));
    assert!(err.to_string().contains("insufficient capacity"));
    assert_eq!(client.calls_to("createSSHKeyPair"), 1);
    assert!(client.key_pairs().is_empty());
    assert!(client.destroy_requests().is_empty());
    assert_eq!(
        ledger
            .ssh_key_name()
            .unwrap_or_else(|failure| panic!("read key: {failure}")),
        None
    );
}

#[rstest]
#[tokio::test]
async fn failed_forwarding_tears_instance_down(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    client.fail_port_forwarding("network is not ready");

    let err = orchestrator(&client, &ledger, &probe)
        .provision(&forwarded_config("guest"))
        .await
        .expect_err("forwarding should fail");

    assert!(matches!(
        err,
        ProvisionError::Allocation(AllocationError::Create { port: 50_001, .. })
    ));
    assert_eq!(client.destroy_requests().len(), 1);
    assert_eq!(
        ledger
            .instance_id()
            .unwrap_or_else(|failure| panic!("read id: {failure}")),
        None
    );
}

#[rstest]
#[tokio::test]
async fn generated_key_password_and_volumes_are_recorded(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    client.set_generated_password("s3cret");
    let config = InstanceConfig {
        keypair: None,
        ..base_config()
    };

    let mut provisioner = orchestrator(&client, &ledger, &probe);
    client.attach_data_volume("vol-7", "vm-1");
    let outcome = provisioner
        .provision(&config)
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    assert_eq!(outcome.instance_id.as_deref(), Some("vm-1"));
    let key_name = ledger
        .ssh_key_name()
        .unwrap_or_else(|err| panic!("read key: {err}"))
        .unwrap_or_else(|| panic!("a key pair should be recorded"));
    assert!(key_name.starts_with("stratus-"));
    assert!(
        client
            .deploy_requests()
            .iter()
            .all(|request| request.key_pair.as_deref() == Some(key_name.as_str()))
    );
    assert_eq!(
        ledger
            .credentials()
            .unwrap_or_else(|err| panic!("read credentials: {err}")),
        Some(String::from("s3cret"))
    );
    assert_eq!(
        ledger
            .entries(LedgerKey::Volumes)
            .unwrap_or_else(|err| panic!("read volumes: {err}")),
        vec![String::from("vol-7")]
    );
}

#[rstest]
#[tokio::test]
async fn interruption_before_create_creates_nothing(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    let interrupt = Interrupt::new();
    interrupt.trigger();

    let outcome = orchestrator(&client, &ledger, &probe)
        .with_interrupt(interrupt)
        .provision(&base_config())
        .await
        .unwrap_or_else(|err| panic!("interrupted run should not fail: {err}"));

    assert_eq!(outcome.status, ProvisionStatus::Interrupted);
    assert_eq!(outcome.instance_id, None);
    assert!(client.deploy_requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn interruption_while_waiting_for_guest_tears_down(ledger: Ledger<MemoryLedgerStore>) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    let probe = ScriptedProbe::reachable_after(u32::MAX);
    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
    });

    let outcome = orchestrator(&client, &ledger, &probe)
        .with_interrupt(interrupt)
        .provision(&base_config())
        .await
        .unwrap_or_else(|err| panic!("interrupted run should not fail: {err}"));

    assert_eq!(outcome.status, ProvisionStatus::Interrupted);
    assert_eq!(outcome.stages.last(), Some(&ProvisionStage::Terminating));
    assert!(
        outcome
            .teardown
            .as_ref()
            .is_some_and(|report| report.destroyed_instance == outcome.instance_id)
    );
    assert!(!probe.attempts().is_empty());
}

#[rstest]
#[tokio::test]
async fn interruption_while_deploy_job_is_pending_tears_down(
    ledger: Ledger<MemoryLedgerStore>,
    probe: ScriptedProbe,
) {
    let client = FakeControlPlane::with_catalog("Advanced", false);
    client.set_pending_job_polls(300);
    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    let settle = client.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
        settle.set_pending_job_polls(0);
    });

    let outcome = orchestrator(&client, &ledger, &probe)
        .with_interrupt(interrupt)
        .provision(&base_config())
        .await
        .unwrap_or_else(|err| panic!("interrupted run should not fail: {err}"));

    assert_eq!(outcome.status, ProvisionStatus::Interrupted);
    assert_eq!(outcome.instance_id.as_deref(), Some("vm-1"));
    assert_eq!(outcome.stages.last(), Some(&ProvisionStage::Terminating));
    assert!(!outcome.stages.contains(&ProvisionStage::WaitingReady));
    let queries = client.total_job_queries();
    assert!(queries < 300, "polled {queries} times");
    assert_eq!(client.destroy_requests().len(), 1);
    assert!(!client.instance_exists("vm-1"));
    assert_eq!(
        ledger
            .instance_id()
            .unwrap_or_else(|err| panic!("read id: {err}")),
        None
    );
    assert!(probe.attempts().is_empty());
}
