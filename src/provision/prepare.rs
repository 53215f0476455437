//! Stages before and including the create-instance call.

use tracing::{debug, info};
use uuid::Uuid;

use super::{Progress, ProvisionError, ProvisionOrchestrator, ProvisionStage};
use crate::config::{InstanceConfig, SecurityGroupRuleSpec, SecurityGroupSpec};
use crate::control_plane::{
    ControlPlane, ControlPlaneError, DeployRequest, ListFilter, ResourceRecord,
    SecurityGroupRuleRequest, TrafficMatch,
};
use crate::handle::{ResourceHandle, ResourceKind};
use crate::ledger::{LedgerKey, LedgerStore};
use crate::port_allocator::PortSource;
use crate::probe::GuestProbe;
use crate::resolver::{ResolveError, ResolvedNetwork, Resolver};
use crate::rules::NetworkPlan;

const NETWORK_TYPE_ATTRIBUTE: &str = "networktype";
const SECURITY_GROUPS_ENABLED_ATTRIBUTE: &str = "securitygroupsenabled";
const BASIC_NETWORK_TYPE: &str = "basic";
const DEFAULT_RULE_CIDR: &str = "0.0.0.0/0";
const KEY_PAIR_PREFIX: &str = "stratus";

/// Everything resolved before the instance is created.
#[derive(Clone, Debug)]
pub(super) struct Prepared {
    pub(super) zone: ResourceHandle,
    pub(super) service_offering: ResourceHandle,
    pub(super) disk_offering: ResourceHandle,
    pub(super) template: ResourceHandle,
    pub(super) network: ResolvedNetwork,
    pub(super) plan: NetworkPlan,
    pub(super) security_group_ids: Vec<String>,
    pub(super) key_pair: Option<String>,
}

impl Prepared {
    pub(super) fn zone_id(&self) -> Option<&str> {
        self.zone.id()
    }

    fn deploy_request(&self, config: &InstanceConfig) -> Result<DeployRequest, ProvisionError> {
        Ok(DeployRequest {
            zone_id: required_id(&self.zone)?,
            template_id: required_id(&self.template)?,
            service_offering_id: required_id(&self.service_offering)?,
            disk_offering_id: self.disk_offering.id().map(str::to_owned),
            network_ids: self.network.handle.id().map(str::to_owned).into_iter().collect(),
            security_group_ids: self.security_group_ids.clone(),
            key_pair: self.key_pair.clone(),
            display_name: config.display_name.clone(),
            group: config.group.clone(),
            name: config.name.clone(),
            user_data: config.user_data.clone(),
            private_ip_address: config.private_ip_address.clone(),
        })
    }
}

/// Instance returned by the create call.
#[derive(Clone, Debug)]
pub(super) struct Created {
    pub(super) instance_id: String,
}

pub(super) fn required_id(handle: &ResourceHandle) -> Result<String, ProvisionError> {
    handle
        .id()
        .map(str::to_owned)
        .ok_or_else(|| ResolveError::Undefined { kind: handle.kind() }.into())
}

fn is_basic_zone(zone: &ResourceRecord) -> bool {
    zone.attribute_str(NETWORK_TYPE_ATTRIBUTE)
        .is_some_and(|kind| kind.eq_ignore_ascii_case(BASIC_NETWORK_TYPE))
}

/// Keeps the first occurrence of each group id, in configuration order.
fn push_unique(ids: &mut Vec<String>, id: String) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn rule_request(group_id: &str, rule: &SecurityGroupRuleSpec) -> SecurityGroupRuleRequest {
    SecurityGroupRuleRequest {
        group_id: group_id.to_owned(),
        direction: rule.direction,
        traffic: TrafficMatch {
            protocol: rule.protocol.clone(),
            cidr_list: rule
                .cidr_list
                .clone()
                .unwrap_or_else(|| String::from(DEFAULT_RULE_CIDR)),
            start_port: rule.start_port,
            end_port: rule.end_port.or(rule.start_port),
            icmp_code: rule.icmp_code,
            icmp_type: rule.icmp_type,
        },
    }
}

impl<C, S, G, P> ProvisionOrchestrator<'_, C, S, G, P>
where
    C: ControlPlane + ?Sized,
    S: LedgerStore,
    G: GuestProbe + ?Sized,
    P: PortSource,
{
    pub(super) async fn prepare(
        &self,
        config: &InstanceConfig,
        progress: &mut Progress,
    ) -> Result<Prepared, ProvisionError> {
        let resolver = Resolver::new(self.client);

        progress.enter(ProvisionStage::Resolving);
        let zone_record = resolver
            .describe(
                &config.zone_handle(),
                &Resolver::<C>::default_filter(ResourceKind::Zone, None),
            )
            .await?;
        let zone = config.zone_handle().completed(
            zone_record.id.clone(),
            zone_record.name.clone(),
        );
        let zone_id = zone.id().map(str::to_owned);
        let service_offering = resolver
            .resolve(
                &config.service_offering_handle(),
                &Resolver::<C>::default_filter(ResourceKind::ServiceOffering, None),
            )
            .await?;
        let disk_offering = resolver
            .resolve(
                &config.disk_offering_handle(),
                &Resolver::<C>::default_filter(ResourceKind::DiskOffering, None),
            )
            .await?;
        let template = resolver
            .resolve(
                &config.template_handle(),
                &Resolver::<C>::default_filter(ResourceKind::Template, zone_id.as_deref()),
            )
            .await?;

        progress.enter(ProvisionStage::ClassifyingZone);
        let (network, plan) = if is_basic_zone(&zone_record) {
            if config.network.requests_networking() {
                progress.warn(format!(
                    "zone {zone} uses basic networking; ignoring the requested network, \
                     static NAT, port forwarding and firewall settings"
                ));
            }
            let plan = NetworkPlan::new(&config.network.without_networking(), config.communicator);
            (ResolvedNetwork::none(), plan)
        } else {
            let network = resolver
                .resolve_network(
                    &config.network.network_handle(),
                    &Resolver::<C>::default_filter(ResourceKind::Network, zone_id.as_deref()),
                )
                .await?;
            (network, NetworkPlan::new(&config.network, config.communicator))
        };

        progress.enter(ProvisionStage::PreparingSecurityGroups);
        let security_group_ids = if zone_record
            .attribute_bool(SECURITY_GROUPS_ENABLED_ATTRIBUTE)
            .unwrap_or(false)
        {
            self.prepare_security_groups(config, &resolver).await?
        } else {
            if config.requests_security_groups() {
                progress.warn(format!(
                    "zone {zone} does not support security groups; ignoring the configured groups"
                ));
            }
            Vec::new()
        };
        let key_pair = self.prepare_key_pair(config).await?;

        Ok(Prepared {
            zone,
            service_offering,
            disk_offering,
            template,
            network,
            plan,
            security_group_ids,
            key_pair,
        })
    }

    async fn prepare_security_groups(
        &self,
        config: &InstanceConfig,
        resolver: &Resolver<'_, C>,
    ) -> Result<Vec<String>, ProvisionError> {
        let filter = Resolver::<C>::default_filter(ResourceKind::SecurityGroup, None);
        let mut ids = Vec::new();

        let by_id = config
            .security_group_ids
            .iter()
            .map(|id| ResourceHandle::with_id(ResourceKind::SecurityGroup, id.as_str()));
        let by_name = config
            .security_group_names
            .iter()
            .map(|name| ResourceHandle::with_name(ResourceKind::SecurityGroup, name.as_str()));
        for handle in by_id.chain(by_name) {
            let group = resolver.resolve(&handle, &filter).await?;
            debug!(group = %group, "using existing security group");
            if let Some(id) = group.id() {
                push_unique(&mut ids, id.to_owned());
            }
        }

        for spec in &config.security_groups {
            let id = self.ensure_security_group(spec, resolver, &filter).await?;
            push_unique(&mut ids, id);
        }
        Ok(ids)
    }

    async fn ensure_security_group(
        &self,
        spec: &SecurityGroupSpec,
        resolver: &Resolver<'_, C>,
        filter: &ListFilter,
    ) -> Result<String, ProvisionError> {
        let submitted = self
            .client
            .create_security_group(&spec.name, spec.description.as_deref())
            .await;
        let id = match self.complete(submitted).await {
            Ok(completed) => completed
                .into_id("createSecurityGroup")
                .map_err(|err| ProvisionError::api("create security group", &spec.name, err))?,
            Err(err) if err.is_already_exists() => {
                let existing = resolver
                    .resolve(
                        &ResourceHandle::with_name(ResourceKind::SecurityGroup, spec.name.as_str()),
                        filter,
                    )
                    .await?;
                info!(name = %spec.name, "security group already exists; reusing it");
                let id = required_id(&existing)?;
                self.ledger.record(LedgerKey::SecurityGroups, &id)?;
                return Ok(id);
            }
            Err(err) => {
                return Err(ProvisionError::api("create security group", &spec.name, err));
            }
        };
        info!(name = %spec.name, group_id = %id, "created security group");
        self.ledger.record(LedgerKey::SecurityGroups, &id)?;

        for rule in &spec.rules {
            let request = rule_request(&id, rule);
            let authorized = self.client.authorize_security_group_rule(&request).await;
            self.complete(authorized).await.map_err(|err| {
                ProvisionError::api("authorize security group rule on", id.as_str(), err)
            })?;
            debug!(group_id = %id, direction = ?rule.direction, "authorized security group rule");
        }
        Ok(id)
    }

    async fn prepare_key_pair(
        &self,
        config: &InstanceConfig,
    ) -> Result<Option<String>, ProvisionError> {
        if !config.needs_generated_key_pair() {
            return Ok(config.keypair.clone());
        }
        let name = format!("{KEY_PAIR_PREFIX}-{}", Uuid::new_v4());
        let key_pair = self
            .client
            .create_ssh_key_pair(&name)
            .await
            .map_err(|err| ProvisionError::api("create SSH key pair", name.as_str(), err))?;
        self.ledger.record_ssh_key_pair(&key_pair)?;
        info!(key_pair = %key_pair.name, "generated SSH key pair");
        Ok(Some(key_pair.name))
    }

    /// Submits the create call and records the instance id before waiting
    /// on its job.
    pub(super) async fn create_instance(
        &self,
        config: &InstanceConfig,
        prepared: &Prepared,
    ) -> Result<Created, ProvisionError> {
        let request = prepared.deploy_request(config)?;
        let failed = |err: ControlPlaneError| {
            ProvisionError::api("create instance in zone", request.zone_id.as_str(), err)
        };
        let submission = self.client.create_instance(&request).await.map_err(failed)?;
        if let Some(id) = submission.id.as_deref() {
            self.ledger.record_instance_id(id)?;
            info!(instance_id = id, "instance submitted");
        }

        let completed = self.complete(Ok(submission)).await.map_err(failed)?;
        let password = completed
            .result
            .as_ref()
            .and_then(|result| result.find_str("password"))
            .map(str::to_owned);
        let instance_id = completed
            .into_id("deployVirtualMachine")
            .map_err(failed)?;
        if self.ledger.instance_id()?.as_deref() != Some(instance_id.as_str()) {
            self.ledger.record_instance_id(&instance_id)?;
        }
        if let Some(secret) = password {
            self.ledger.record_credentials(&secret)?;
            debug!(instance_id = %instance_id, "recorded generated password");
        }
        Ok(Created { instance_id })
    }
}
