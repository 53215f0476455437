//! Static NAT, port forwarding and firewall configuration.

use tracing::info;

use super::prepare::{Prepared, required_id};
use super::{Progress, ProvisionError, ProvisionOrchestrator};
use crate::config::InstanceConfig;
use crate::control_plane::{
    ControlPlane, ControlPlaneError, FirewallRequest, InstanceRecord, NetworkAclRequest,
    StaticNatRequest, Submission,
};
use crate::handle::ResourceKind;
use crate::ledger::{FirewallRecord, FirewallRuleKind, LedgerKey, LedgerStore};
use crate::port_allocator::{PortAllocator, PortSource, RuleTemplate};
use crate::probe::{GuestEndpoint, GuestProbe};
use crate::resolver::Resolver;
use crate::rules::{Channel, FirewallRule, NetworkPlan};

/// Networking as configured for the instance.
#[derive(Clone, Debug)]
pub(super) struct NetworkState {
    plan: NetworkPlan,
    forwarding_address: Option<String>,
    /// Channel of the guest family: ssh/winrm for Linux, rdp for Windows.
    channel: Channel,
}

impl NetworkState {
    /// Endpoint the guest is expected to answer on: the forwarded public
    /// port of the family's channel when one exists, the instance address
    /// otherwise.
    pub(super) fn guest_endpoint(&self, instance: &InstanceRecord) -> Option<GuestEndpoint> {
        if let Some(host) = self.forwarding_address.as_ref()
            && let Some(port) = self.plan.public_port(self.channel)
        {
            return Some(GuestEndpoint {
                host: host.clone(),
                port,
            });
        }
        instance.ip_address.as_ref().map(|host| GuestEndpoint {
            host: host.clone(),
            port: self.plan.private_port(self.channel),
        })
    }
}

impl<C, S, G, P> ProvisionOrchestrator<'_, C, S, G, P>
where
    C: ControlPlane + ?Sized,
    S: LedgerStore,
    G: GuestProbe + ?Sized,
    P: PortSource,
{
    pub(super) async fn configure_network(
        &mut self,
        config: &InstanceConfig,
        prepared: &Prepared,
        instance_id: &str,
        progress: &mut Progress,
    ) -> Result<NetworkState, ProvisionError> {
        let mut plan = prepared.plan.clone();
        for channel in [Channel::Ssh, Channel::Rdp] {
            if plan.public_port(channel).is_none()
                && let Some(port) = self.ledger.public_port(channel)?
            {
                plan = plan.with_public_port(channel, port);
            }
        }

        self.enable_static_nat(&plan, prepared, instance_id).await?;
        let forwarding_address = self.forwarding_address(&plan, prepared).await?;
        let forwarded = self
            .forward_ports(config, plan, prepared, instance_id, progress)
            .await?;
        self.open_firewall(&forwarded, prepared, progress).await?;

        Ok(NetworkState {
            plan: forwarded,
            forwarding_address,
            channel: Channel::for_family(config.guest),
        })
    }

    async fn enable_static_nat(
        &self,
        plan: &NetworkPlan,
        prepared: &Prepared,
        instance_id: &str,
    ) -> Result<(), ProvisionError> {
        let resolver = Resolver::new(self.client);
        let filter =
            Resolver::<C>::default_filter(ResourceKind::PublicIpAddress, prepared.zone_id());
        for handle in plan.static_nat_ips() {
            let ip = resolver.resolve(&handle, &filter).await?;
            let ip_address_id = required_id(&ip)?;
            let request = StaticNatRequest {
                ip_address_id: ip_address_id.clone(),
                virtual_machine_id: instance_id.to_owned(),
                network_id: prepared.network.handle.id().map(str::to_owned),
            };
            let submitted = self.client.enable_static_nat(&request).await;
            self.complete(submitted).await.map_err(|err| {
                ProvisionError::api("enable static NAT on", ip_address_id.as_str(), err)
            })?;
            self.ledger.record(LedgerKey::StaticNat, &ip_address_id)?;
            info!(instance_id, ip = %ip, "enabled static NAT");
        }
        Ok(())
    }

    async fn forwarding_address(
        &self,
        plan: &NetworkPlan,
        prepared: &Prepared,
    ) -> Result<Option<String>, ProvisionError> {
        let handle = plan.forwarding_ip();
        if handle.is_undefined() {
            return Ok(None);
        }
        let filter =
            Resolver::<C>::default_filter(ResourceKind::PublicIpAddress, prepared.zone_id());
        let ip = Resolver::new(self.client).resolve(&handle, &filter).await?;
        Ok(ip.name().map(str::to_owned))
    }

    /// Creates forwarding rules and returns the plan with every allocated
    /// public port filled in.
    async fn forward_ports(
        &mut self,
        config: &InstanceConfig,
        plan: NetworkPlan,
        prepared: &Prepared,
        instance_id: &str,
        progress: &mut Progress,
    ) -> Result<NetworkPlan, ProvisionError> {
        let resolver = Resolver::new(self.client);
        let filter =
            Resolver::<C>::default_filter(ResourceKind::PublicIpAddress, prepared.zone_id());
        let already_created = !self.ledger.entries(LedgerKey::PortForwarding)?.is_empty();
        let rules = plan.port_forwarding_rules(config.guest, already_created)?;

        let mut forwarded = plan;
        for rule in rules {
            if rule.ip.is_undefined() {
                if rule.channel.is_none() {
                    progress.warn(format!(
                        "port forwarding rule for private port {} names no public IP and no \
                         pf_ip_address is set; skipping it",
                        rule.private_port
                    ));
                }
                continue;
            }
            let ip = resolver.resolve(&rule.ip, &filter).await?;
            let template = RuleTemplate {
                ip_address_id: required_id(&ip)?,
                protocol: rule.protocol.clone(),
                public_port: rule.public_port,
                private_port: rule.private_port,
                open_firewall: (!prepared.network.is_vpc()).then_some(rule.open_firewall),
                virtual_machine_id: instance_id.to_owned(),
                network_id: prepared.network.handle.id().map(str::to_owned),
            };
            let allocated = PortAllocator::new(self.client, self.ledger, &mut self.ports)
                .with_poll_interval(self.poll_interval)
                .with_interrupt(self.interrupt.clone())
                .allocate_and_create(&template, forwarded.random_range(), rule.channel)
                .await?;
            self.ledger
                .record(LedgerKey::PortForwarding, &allocated.rule_id)?;
            if allocated.attempts > 1 {
                progress.warn(format!(
                    "public port {} was free only after {} attempts",
                    allocated.public_port, allocated.attempts
                ));
            }
            info!(
                instance_id,
                public_port = allocated.public_port,
                private_port = rule.private_port,
                rule_id = %allocated.rule_id,
                "forwarded port"
            );
            if let Some(channel) = rule.channel {
                forwarded = forwarded.with_public_port(channel, allocated.public_port);
            }
        }
        Ok(forwarded)
    }

    async fn open_firewall(
        &self,
        plan: &NetworkPlan,
        prepared: &Prepared,
        progress: &mut Progress,
    ) -> Result<(), ProvisionError> {
        let resolver = Resolver::new(self.client);
        let filter =
            Resolver::<C>::default_filter(ResourceKind::PublicIpAddress, prepared.zone_id());
        for rule in plan.firewall_rules()? {
            if let Some(acl_id) = prepared.network.acl_id.as_deref() {
                let request = NetworkAclRequest {
                    acl_id: acl_id.to_owned(),
                    traffic: rule.traffic(),
                };
                let submitted = self.client.create_network_acl(&request).await;
                self.record_firewall(
                    submitted,
                    FirewallRuleKind::NetworkAcl,
                    &rule,
                    acl_id,
                    progress,
                )
                .await?;
                continue;
            }
            if rule.ip.is_undefined() {
                progress.warn(format!(
                    "{} firewall rule for {} names no public IP; skipping it",
                    rule.protocol, rule.cidr_list
                ));
                continue;
            }
            let ip = resolver.resolve(&rule.ip, &filter).await?;
            let ip_address_id = required_id(&ip)?;
            let request = FirewallRequest {
                ip_address_id: ip_address_id.clone(),
                traffic: rule.traffic(),
            };
            let submitted = self.client.create_firewall_rule(&request).await;
            self.record_firewall(
                submitted,
                FirewallRuleKind::FirewallRule,
                &rule,
                &ip_address_id,
                progress,
            )
            .await?;
        }
        Ok(())
    }

    async fn record_firewall(
        &self,
        submitted: Result<Submission, ControlPlaneError>,
        kind: FirewallRuleKind,
        rule: &FirewallRule,
        target: &str,
        progress: &mut Progress,
    ) -> Result<(), ProvisionError> {
        let action = match kind {
            FirewallRuleKind::NetworkAcl => "create network ACL rule on",
            FirewallRuleKind::FirewallRule => "create firewall rule on",
        };
        match self.complete(submitted).await {
            Ok(completed) => {
                let id = completed
                    .into_id(action)
                    .map_err(|err| ProvisionError::api(action, target, err))?;
                self.ledger.record_firewall_rule(&FirewallRecord {
                    id: id.clone(),
                    kind,
                })?;
                info!(rule_id = %id, kind = kind.tag(), cidr = %rule.cidr_list, "opened firewall");
                Ok(())
            }
            Err(err) if err.is_range_conflict() => {
                progress.warn(format!(
                    "an equivalent firewall rule already exists on {target}; leaving it in place"
                ));
                Ok(())
            }
            Err(err) => Err(ProvisionError::api(action, target, err)),
        }
    }
}
