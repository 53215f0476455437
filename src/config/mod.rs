//! Per-instance configuration and process-wide orchestrator settings.
//!
//! [`InstanceConfig`] is an immutable snapshot of what the caller asked
//! for. Orchestrators never rewrite it; anything derived during
//! provisioning lives in separate values such as
//! [`crate::rules::NetworkPlan`].

use std::ffi::OsString;
use std::ops::Range;
use std::time::Duration;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::OrthoConfig;
use ortho_config::toml;
use serde::Deserialize;
use thiserror::Error;

use crate::control_plane::Direction;
use crate::handle::{ResourceHandle, ResourceKind};

/// Default bound on waiting for an instance to report `Running`.
pub const DEFAULT_INSTANCE_READY_TIMEOUT_SECS: u64 = 120;
/// Default private RDP port.
pub const DEFAULT_RDP_PORT: u16 = 3389;
/// First port of the default random public port range.
pub const DEFAULT_RANDOM_RANGE_START: u16 = 49152;
/// End (exclusive) of the default random public port range.
pub const DEFAULT_RANDOM_RANGE_END: u16 = 65535;

/// Guest operating system family, which selects the forwarded channel.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GuestFamily {
    /// Linux and other SSH-capable guests.
    #[default]
    Linux,
    /// Windows guests, reached over RDP.
    Windows,
}

/// Transport the host uses to talk to the guest.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
pub enum Transport {
    /// Secure shell.
    #[default]
    #[serde(rename = "ssh")]
    Ssh,
    /// Windows remote management over HTTP.
    #[serde(rename = "winrm")]
    WinRm,
}

impl Transport {
    /// Port the transport listens on inside the guest.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Ssh => 22,
            Self::WinRm => 5985,
        }
    }
}

/// Half-open range of candidate public ports, `[start, end)`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub struct PortRange {
    /// First candidate port.
    pub start: u16,
    /// First port past the range.
    pub end: u16,
}

impl PortRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// True when the range holds no port.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Range form suitable for random sampling.
    #[must_use]
    pub const fn as_range(&self) -> Range<u16> {
        self.start..self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(DEFAULT_RANDOM_RANGE_START, DEFAULT_RANDOM_RANGE_END)
    }
}

/// Static NAT binding request; one of the two fields identifies the IP.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StaticNatRule {
    /// Public IP address identifier.
    #[serde(alias = "ipaddressid")]
    pub ip_address_id: Option<String>,
    /// Public IP address value.
    #[serde(alias = "ipaddress")]
    pub ip_address: Option<String>,
}

/// Partially specified port forwarding rule.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PortForwardingFragment {
    /// Public IP address identifier.
    #[serde(alias = "ipaddressid")]
    pub ip_address_id: Option<String>,
    /// Public IP address value.
    #[serde(alias = "ipaddress")]
    pub ip_address: Option<String>,
    /// Transport protocol, `tcp` when absent.
    pub protocol: Option<String>,
    /// Public port; defaults to the private port.
    #[serde(alias = "publicport")]
    pub public_port: Option<u16>,
    /// Private port; defaults to the public port.
    #[serde(alias = "privateport")]
    pub private_port: Option<u16>,
    /// Ask the control plane to open the firewall for this rule.
    #[serde(alias = "openfirewall")]
    pub open_firewall: Option<bool>,
    /// Derive a trusted-network firewall rule for this forwarding rule.
    pub generate_firewall: Option<bool>,
}

/// Partially specified firewall rule.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FirewallFragment {
    /// Public IP address identifier.
    #[serde(alias = "ipaddressid")]
    pub ip_address_id: Option<String>,
    /// Public IP address value.
    #[serde(alias = "ipaddress")]
    pub ip_address: Option<String>,
    /// Transport protocol, `tcp` when absent.
    pub protocol: Option<String>,
    /// Comma separated source CIDRs; defaults to the trusted networks.
    #[serde(alias = "cidrlist")]
    pub cidr_list: Option<String>,
    /// First port of the range.
    #[serde(alias = "startport")]
    pub start_port: Option<u16>,
    /// Last port of the range; defaults to the first.
    #[serde(alias = "endport")]
    pub end_port: Option<u16>,
    /// ICMP code.
    #[serde(alias = "icmpcode")]
    pub icmp_code: Option<i32>,
    /// ICMP type.
    #[serde(alias = "icmptype")]
    pub icmp_type: Option<i32>,
}

/// Rule of a security group created during provisioning.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SecurityGroupRuleSpec {
    /// Ingress or egress.
    #[serde(rename = "type")]
    pub direction: Direction,
    /// Transport protocol.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Comma separated CIDRs.
    #[serde(default, alias = "cidrlist")]
    pub cidr_list: Option<String>,
    /// First port of the range.
    #[serde(default, alias = "startport")]
    pub start_port: Option<u16>,
    /// Last port of the range.
    #[serde(default, alias = "endport")]
    pub end_port: Option<u16>,
    /// ICMP type.
    #[serde(default, alias = "icmptype")]
    pub icmp_type: Option<i32>,
    /// ICMP code.
    #[serde(default, alias = "icmpcode")]
    pub icmp_code: Option<i32>,
}

/// Security group to create (or reuse, if it already exists) for the
/// instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SecurityGroupSpec {
    /// Group name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Rules to authorize on the group.
    #[serde(default)]
    pub rules: Vec<SecurityGroupRuleSpec>,
}

/// Networking part of the instance configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network identifier.
    pub network_id: Option<String>,
    /// Network name.
    pub network_name: Option<String>,
    /// Static NAT bindings to enable.
    pub static_nat: Vec<StaticNatRule>,
    /// Public IP (by id) used for forwarding and firewall rules.
    pub pf_ip_address_id: Option<String>,
    /// Public IP (by value) used for forwarding and firewall rules.
    pub pf_ip_address: Option<String>,
    /// Fixed public port of the ssh/winrm channel.
    pub pf_public_port: Option<u16>,
    /// Private port of the ssh/winrm channel; defaults to the transport port.
    pub pf_private_port: Option<u16>,
    /// Fixed public port of the RDP channel.
    pub pf_public_rdp_port: Option<u16>,
    /// Private port of the RDP channel.
    pub pf_private_rdp_port: u16,
    /// Range for random public ports; `None` disables random allocation.
    pub pf_public_port_randomrange: Option<PortRange>,
    /// Default `openfirewall` flag for forwarding rules.
    pub pf_open_firewall: bool,
    /// CIDRs allowed to reach forwarded ports.
    pub pf_trusted_networks: Vec<String>,
    /// Explicit forwarding rules.
    pub port_forwarding_rules: Vec<PortForwardingFragment>,
    /// Explicit firewall rules.
    pub firewall_rules: Vec<FirewallFragment>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: None,
            network_name: None,
            static_nat: Vec::new(),
            pf_ip_address_id: None,
            pf_ip_address: None,
            pf_public_port: None,
            pf_private_port: None,
            pf_public_rdp_port: None,
            pf_private_rdp_port: DEFAULT_RDP_PORT,
            pf_public_port_randomrange: Some(PortRange::default()),
            pf_open_firewall: true,
            pf_trusted_networks: Vec::new(),
            port_forwarding_rules: Vec::new(),
            firewall_rules: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// Handle for the requested network.
    #[must_use]
    pub fn network_handle(&self) -> ResourceHandle {
        ResourceHandle::new(
            ResourceKind::Network,
            self.network_id.clone(),
            self.network_name.clone(),
        )
    }

    /// Handle for the forwarding public IP.
    #[must_use]
    pub fn pf_ip_handle(&self) -> ResourceHandle {
        ResourceHandle::new(
            ResourceKind::PublicIpAddress,
            self.pf_ip_address_id.clone(),
            self.pf_ip_address.clone(),
        )
    }

    /// True when the caller asked for any user-addressable networking.
    #[must_use]
    pub fn requests_networking(&self) -> bool {
        !self.network_handle().is_undefined()
            || !self.pf_ip_handle().is_undefined()
            || !self.static_nat.is_empty()
            || !self.port_forwarding_rules.is_empty()
            || !self.firewall_rules.is_empty()
    }

    /// Copy with every network, NAT, forwarding and firewall setting
    /// cleared, used for zones without user-addressable networking.
    #[must_use]
    pub fn without_networking(&self) -> Self {
        Self {
            pf_private_port: self.pf_private_port,
            pf_private_rdp_port: self.pf_private_rdp_port,
            pf_public_port_randomrange: None,
            pf_open_firewall: self.pf_open_firewall,
            ..Self::default()
        }
    }
}

/// Complete per-instance configuration surface.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct InstanceConfig {
    /// Zone identifier.
    pub zone_id: Option<String>,
    /// Zone name.
    pub zone_name: Option<String>,
    /// Service offering identifier.
    pub service_offering_id: Option<String>,
    /// Service offering name.
    pub service_offering_name: Option<String>,
    /// Disk offering identifier.
    pub disk_offering_id: Option<String>,
    /// Disk offering name.
    pub disk_offering_name: Option<String>,
    /// Template identifier.
    pub template_id: Option<String>,
    /// Template name.
    pub template_name: Option<String>,
    /// Requested image reference; the template name falls back to it.
    pub image: Option<String>,
    /// Display name of the instance.
    pub display_name: Option<String>,
    /// Host name of the instance.
    pub name: Option<String>,
    /// Instance group.
    pub group: Option<String>,
    /// User data passed to the guest.
    pub user_data: Option<String>,
    /// Requested private address.
    pub private_ip_address: Option<String>,
    /// Existing key pair name; suppresses key generation.
    pub keypair: Option<String>,
    /// Path of an existing private key; suppresses key generation.
    pub ssh_key: Option<String>,
    /// User name for guest credentials.
    pub vm_user: Option<String>,
    /// Guest operating system family.
    pub guest: GuestFamily,
    /// Transport used to reach the guest.
    pub communicator: Transport,
    /// Existing security groups by id.
    pub security_group_ids: Vec<String>,
    /// Existing security groups by name.
    pub security_group_names: Vec<String>,
    /// Security groups to create.
    pub security_groups: Vec<SecurityGroupSpec>,
    /// Networking configuration.
    #[serde(flatten)]
    pub network: NetworkConfig,
    /// Seconds to wait for the instance to report `Running`.
    pub instance_ready_timeout: u64,
    /// Expunge the instance on destroy instead of leaving it recoverable.
    pub expunge_on_destroy: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            zone_id: None,
            zone_name: None,
            service_offering_id: None,
            service_offering_name: None,
            disk_offering_id: None,
            disk_offering_name: None,
            template_id: None,
            template_name: None,
            image: None,
            display_name: None,
            name: None,
            group: None,
            user_data: None,
            private_ip_address: None,
            keypair: None,
            ssh_key: None,
            vm_user: None,
            guest: GuestFamily::default(),
            communicator: Transport::default(),
            security_group_ids: Vec::new(),
            security_group_names: Vec::new(),
            security_groups: Vec::new(),
            network: NetworkConfig::default(),
            instance_ready_timeout: DEFAULT_INSTANCE_READY_TIMEOUT_SECS,
            expunge_on_destroy: false,
        }
    }
}

impl InstanceConfig {
    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the document is malformed or
    /// names an unknown guest family or transport.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, or
    /// [`ConfigError::Parse`] when it cannot be parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let file_name = path.file_name().ok_or_else(|| ConfigError::Io {
            path: path.to_string(),
            message: String::from("configuration file path is missing a filename"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            ConfigError::Io {
                path: parent.to_string(),
                message: err.to_string(),
            }
        })?;
        let contents = dir.read_to_string(file_name).map_err(|err| ConfigError::Io {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Performs semantic validation. Error messages name the keys that fix
    /// the problem.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required resource is
    /// unspecified and [`ConfigError::Invalid`] for inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.zone_handle(), "zone", "zone_id", "zone_name")?;
        require(
            &self.service_offering_handle(),
            "service offering",
            "service_offering_id",
            "service_offering_name",
        )?;
        require(
            &self.template_handle(),
            "template",
            "template_id",
            "template_name or image",
        )?;
        if self.instance_ready_timeout == 0 {
            return Err(ConfigError::Invalid(String::from(
                "instance_ready_timeout must be at least one second",
            )));
        }
        if let Some(range) = self
            .network
            .pf_public_port_randomrange
            .filter(PortRange::is_empty)
        {
            return Err(ConfigError::Invalid(format!(
                "pf_public_port_randomrange [{}, {}) holds no port",
                range.start, range.end
            )));
        }
        if let Some(spec) = self.security_groups.iter().find(|spec| spec.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "security group specification with {} rule(s) has no name",
                spec.rules.len()
            )));
        }
        Ok(())
    }

    /// Handle for the zone.
    #[must_use]
    pub fn zone_handle(&self) -> ResourceHandle {
        ResourceHandle::new(ResourceKind::Zone, self.zone_id.clone(), self.zone_name.clone())
    }

    /// Handle for the service offering.
    #[must_use]
    pub fn service_offering_handle(&self) -> ResourceHandle {
        ResourceHandle::new(
            ResourceKind::ServiceOffering,
            self.service_offering_id.clone(),
            self.service_offering_name.clone(),
        )
    }

    /// Handle for the optional disk offering.
    #[must_use]
    pub fn disk_offering_handle(&self) -> ResourceHandle {
        ResourceHandle::new(
            ResourceKind::DiskOffering,
            self.disk_offering_id.clone(),
            self.disk_offering_name.clone(),
        )
    }

    /// Handle for the template; the name falls back to the image reference.
    #[must_use]
    pub fn template_handle(&self) -> ResourceHandle {
        let name = self
            .template_name
            .clone()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.image.clone());
        ResourceHandle::new(ResourceKind::Template, self.template_id.clone(), name)
    }

    /// True when any security group configuration is present.
    #[must_use]
    pub fn requests_security_groups(&self) -> bool {
        !self.security_group_ids.is_empty()
            || !self.security_group_names.is_empty()
            || !self.security_groups.is_empty()
    }

    /// True when a key pair should be generated for the instance.
    #[must_use]
    pub const fn needs_generated_key_pair(&self) -> bool {
        matches!(self.guest, GuestFamily::Linux) && self.keypair.is_none() && self.ssh_key.is_none()
    }

    /// Number of two-second readiness checks allowed by the timeout.
    #[must_use]
    pub fn ready_attempts(&self) -> u64 {
        self.instance_ready_timeout.checked_div(2).unwrap_or(0).max(1)
    }
}

fn require(
    handle: &ResourceHandle,
    description: &str,
    id_key: &str,
    name_key: &str,
) -> Result<(), ConfigError> {
    if handle.is_undefined() {
        return Err(ConfigError::MissingField(format!(
            "missing {description}: set {id_key} or {name_key}"
        )));
    }
    Ok(())
}

fn default_protocol() -> String {
    String::from("tcp")
}

/// Process-wide tunables layered via `OrthoConfig`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "STRATUS",
    discovery(
        app_name = "stratus",
        env_var = "STRATUS_CONFIG_PATH",
        config_file_name = "stratus.toml",
        dotfile_name = ".stratus.toml",
        project_file_name = "stratus.toml"
    )
)]
pub struct OrchestratorSettings {
    /// Milliseconds between job, readiness and guest polls.
    #[ortho_config(default = 2000)]
    pub poll_interval_ms: u64,
    /// Milliseconds allowed for one guest connection attempt.
    #[ortho_config(default = 2000)]
    pub probe_timeout_ms: u64,
    /// Seconds to wait before retrying a failed security group delete.
    #[ortho_config(default = 30)]
    pub security_group_retry_secs: u64,
}

impl OrchestratorSettings {
    /// Settings used when nothing is configured.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            poll_interval_ms: 2000,
            probe_timeout_ms: 2000,
            security_group_retry_secs: 30,
        }
    }

    /// Loads settings without parsing CLI arguments. Values still merge
    /// defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails and
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let settings = Self::load_from_iter([OsString::from("stratus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the poll interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll_interval_ms must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Interval between polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout of one guest connection attempt.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Backoff before retrying a security group delete.
    #[must_use]
    pub const fn security_group_retry(&self) -> Duration {
        Duration::from_secs(self.security_group_retry_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Sources could not be parsed or merged.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// A configuration file could not be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: String,
        /// Human-readable error message.
        message: String,
    },
}
