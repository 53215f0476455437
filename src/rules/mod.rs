//! Derivation of complete networking rules from partial configuration.
//!
//! Everything here is pure. [`NetworkPlan`] wraps an immutable
//! [`NetworkConfig`] snapshot together with the public ports known so far;
//! learning a new port yields a new plan rather than mutating the old one.

use thiserror::Error;

use crate::config::{
    FirewallFragment, GuestFamily, NetworkConfig, PortForwardingFragment, PortRange, Transport,
};
use crate::control_plane::TrafficMatch;
use crate::handle::{ResourceHandle, ResourceKind};

const DEFAULT_PROTOCOL: &str = "tcp";

/// Guest access channel that receives a forwarded public port.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Channel {
    /// SSH or `WinRM`, depending on the configured transport.
    Ssh,
    /// Remote desktop.
    Rdp,
}

impl Channel {
    /// Channel used to reach guests of `family`.
    #[must_use]
    pub const fn for_family(family: GuestFamily) -> Self {
        match family {
            GuestFamily::Linux => Self::Ssh,
            GuestFamily::Windows => Self::Rdp,
        }
    }
}

/// Errors raised while completing rule fragments.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeriveError {
    /// A port forwarding fragment named neither a public nor a private port.
    #[error("port forwarding rule #{index} needs a public or private port")]
    MissingPort {
        /// Zero-based position of the fragment in the configuration.
        index: usize,
    },
}

/// Fully specified port forwarding rule.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortForwardingRule {
    /// Public IP the rule is created on.
    pub ip: ResourceHandle,
    /// Transport protocol.
    pub protocol: String,
    /// Public port; `None` asks the allocator to draw one.
    pub public_port: Option<u16>,
    /// Private port on the instance.
    pub private_port: u16,
    /// Whether the control plane should open its own firewall rule.
    pub open_firewall: bool,
    /// Whether a trusted-network firewall rule should accompany this rule.
    pub generate_firewall: bool,
    /// Channel served by an implicit rule; `None` for explicit rules.
    pub channel: Option<Channel>,
}

/// Fully specified firewall rule.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirewallRule {
    /// Public IP the rule guards.
    pub ip: ResourceHandle,
    /// Transport protocol.
    pub protocol: String,
    /// Comma separated source CIDRs.
    pub cidr_list: String,
    /// First port of the range.
    pub start_port: Option<u16>,
    /// Last port of the range.
    pub end_port: Option<u16>,
    /// ICMP code.
    pub icmp_code: Option<i32>,
    /// ICMP type.
    pub icmp_type: Option<i32>,
}

impl FirewallRule {
    /// Traffic selector sent with firewall and ACL requests.
    #[must_use]
    pub fn traffic(&self) -> TrafficMatch {
        TrafficMatch {
            protocol: self.protocol.clone(),
            cidr_list: self.cidr_list.clone(),
            start_port: self.start_port,
            end_port: self.end_port,
            icmp_code: self.icmp_code,
            icmp_type: self.icmp_type,
        }
    }
}

/// Immutable networking plan for one instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkPlan {
    config: NetworkConfig,
    private_port: u16,
    public_port: Option<u16>,
    public_rdp_port: Option<u16>,
}

impl NetworkPlan {
    /// Builds a plan from configuration. The private port of the ssh
    /// channel falls back to the port of `transport`.
    #[must_use]
    pub fn new(config: &NetworkConfig, transport: Transport) -> Self {
        Self {
            config: config.clone(),
            private_port: config
                .pf_private_port
                .unwrap_or_else(|| transport.default_port()),
            public_port: config.pf_public_port,
            public_rdp_port: config.pf_public_rdp_port,
        }
    }

    /// Configuration snapshot the plan was derived from.
    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Returns a copy of the plan with `port` recorded for `channel`.
    #[must_use]
    pub fn with_public_port(&self, channel: Channel, port: u16) -> Self {
        let mut next = self.clone();
        match channel {
            Channel::Ssh => next.public_port = Some(port),
            Channel::Rdp => next.public_rdp_port = Some(port),
        }
        next
    }

    /// Public port known for `channel`, fixed or allocated.
    #[must_use]
    pub const fn public_port(&self, channel: Channel) -> Option<u16> {
        match channel {
            Channel::Ssh => self.public_port,
            Channel::Rdp => self.public_rdp_port,
        }
    }

    /// Private port served by `channel`.
    #[must_use]
    pub const fn private_port(&self, channel: Channel) -> u16 {
        match channel {
            Channel::Ssh => self.private_port,
            Channel::Rdp => self.config.pf_private_rdp_port,
        }
    }

    /// Range that random public ports are drawn from.
    #[must_use]
    pub const fn random_range(&self) -> Option<PortRange> {
        self.config.pf_public_port_randomrange
    }

    /// Public IP used by forwarding and firewall rules without their own.
    #[must_use]
    pub fn forwarding_ip(&self) -> ResourceHandle {
        self.config.pf_ip_handle()
    }

    /// Public IPs that should be bound with static NAT.
    #[must_use]
    pub fn static_nat_ips(&self) -> Vec<ResourceHandle> {
        self.config
            .static_nat
            .iter()
            .map(|rule| {
                ResourceHandle::new(
                    ResourceKind::PublicIpAddress,
                    rule.ip_address_id.clone(),
                    rule.ip_address.clone(),
                )
            })
            .filter(|handle| !handle.is_undefined())
            .collect()
    }

    /// True when neither channel has a public port yet.
    #[must_use]
    pub const fn needs_public_port(&self) -> bool {
        self.public_port.is_none() && self.public_rdp_port.is_none()
    }

    /// True when a forwarding IP is configured together with a source of
    /// public ports.
    #[must_use]
    pub fn has_port_forwarding(&self) -> bool {
        !self.forwarding_ip().is_undefined() && self.has_public_port_source()
    }

    fn has_public_port_source(&self) -> bool {
        !self.needs_public_port() || self.random_range().is_some()
    }

    /// Port forwarding rules to create for a guest of `family`.
    ///
    /// Explicit fragments are completed and returned in order. Without
    /// fragments, a single implicit rule for the family's channel is
    /// produced, unless rules were already created for this instance or no
    /// public port can be obtained.
    ///
    /// # Errors
    ///
    /// Returns [`DeriveError::MissingPort`] for a fragment without ports.
    pub fn port_forwarding_rules(
        &self,
        family: GuestFamily,
        already_created: bool,
    ) -> Result<Vec<PortForwardingRule>, DeriveError> {
        if !self.config.port_forwarding_rules.is_empty() {
            return self.explicit_forwarding_rules();
        }
        if already_created || !self.has_public_port_source() {
            return Ok(Vec::new());
        }

        let channel = Channel::for_family(family);
        Ok(vec![PortForwardingRule {
            ip: self.forwarding_ip(),
            protocol: String::from(DEFAULT_PROTOCOL),
            public_port: self.public_port(channel),
            private_port: self.private_port(channel),
            open_firewall: self.config.pf_open_firewall,
            generate_firewall: false,
            channel: Some(channel),
        }])
    }

    fn explicit_forwarding_rules(&self) -> Result<Vec<PortForwardingRule>, DeriveError> {
        self.config
            .port_forwarding_rules
            .iter()
            .enumerate()
            .map(|(index, fragment)| self.complete_forwarding(index, fragment))
            .collect()
    }

    fn complete_forwarding(
        &self,
        index: usize,
        fragment: &PortForwardingFragment,
    ) -> Result<PortForwardingRule, DeriveError> {
        let (public_port, private_port) = match (fragment.public_port, fragment.private_port) {
            (Some(public), Some(private)) => (public, private),
            (Some(public), None) => (public, public),
            (None, Some(private)) => (private, private),
            (None, None) => return Err(DeriveError::MissingPort { index }),
        };
        Ok(PortForwardingRule {
            ip: self.ip_or_default(
                fragment.ip_address_id.as_deref(),
                fragment.ip_address.as_deref(),
            ),
            protocol: protocol_or_default(fragment.protocol.as_deref()),
            public_port: Some(public_port),
            private_port,
            open_firewall: fragment.open_firewall.unwrap_or(self.config.pf_open_firewall),
            generate_firewall: fragment.generate_firewall.unwrap_or(false),
            channel: None,
        })
    }

    /// Firewall rules to create once port forwarding is in place.
    ///
    /// Explicit fragments come first. When trusted networks are configured
    /// and the control plane is not opening the firewall itself, one rule
    /// per known public port is added, followed by one rule per explicit
    /// forwarding fragment that asks for firewall generation and keeps its
    /// own firewall closed.
    ///
    /// # Errors
    ///
    /// Returns [`DeriveError::MissingPort`] when a forwarding fragment
    /// cannot be completed.
    pub fn firewall_rules(&self) -> Result<Vec<FirewallRule>, DeriveError> {
        let mut rules: Vec<FirewallRule> = self
            .config
            .firewall_rules
            .iter()
            .map(|fragment| self.complete_firewall(fragment))
            .collect();

        let trusted = self.trusted_cidrs();
        if !self.config.pf_trusted_networks.is_empty() && !self.config.pf_open_firewall {
            rules.extend(
                [Channel::Ssh, Channel::Rdp]
                    .into_iter()
                    .filter_map(|channel| self.public_port(channel))
                    .map(|port| FirewallRule {
                        ip: self.forwarding_ip(),
                        protocol: String::from(DEFAULT_PROTOCOL),
                        cidr_list: trusted.clone(),
                        start_port: Some(port),
                        end_port: Some(port),
                        icmp_code: None,
                        icmp_type: None,
                    }),
            );
        }

        for rule in self.explicit_forwarding_rules()? {
            if rule.generate_firewall && !rule.open_firewall {
                rules.push(FirewallRule {
                    ip: rule.ip,
                    protocol: rule.protocol,
                    cidr_list: trusted.clone(),
                    start_port: rule.public_port,
                    end_port: rule.public_port,
                    icmp_code: None,
                    icmp_type: None,
                });
            }
        }
        Ok(rules)
    }

    fn complete_firewall(&self, fragment: &FirewallFragment) -> FirewallRule {
        FirewallRule {
            ip: self.ip_or_default(
                fragment.ip_address_id.as_deref(),
                fragment.ip_address.as_deref(),
            ),
            protocol: protocol_or_default(fragment.protocol.as_deref()),
            cidr_list: fragment
                .cidr_list
                .clone()
                .unwrap_or_else(|| self.trusted_cidrs()),
            start_port: fragment.start_port,
            end_port: fragment.end_port.or(fragment.start_port),
            icmp_code: fragment.icmp_code,
            icmp_type: fragment.icmp_type,
        }
    }

    fn ip_or_default(&self, id: Option<&str>, address: Option<&str>) -> ResourceHandle {
        let handle = ResourceHandle::new(
            ResourceKind::PublicIpAddress,
            id.map(str::to_owned),
            address.map(str::to_owned),
        );
        if handle.is_undefined() {
            self.forwarding_ip()
        } else {
            handle
        }
    }

    fn trusted_cidrs(&self) -> String {
        self.config.pf_trusted_networks.join(",")
    }
}

fn protocol_or_default(protocol: Option<&str>) -> String {
    protocol
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_PROTOCOL)
        .to_owned()
}
