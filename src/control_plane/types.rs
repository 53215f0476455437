//! Request and record types exchanged with the control plane.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value filter passed to listing calls (for example `zoneid`).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListFilter(BTreeMap<String, String>);

impl ListFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a filter entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns the value registered for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterates over the filter entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// One entry returned by a listing call.
///
/// `name` carries the field that the resolver compares names against. For
/// public IP addresses that is the textual address.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceRecord {
    /// Control-plane identifier.
    pub id: String,
    /// Display name, when the entity has one.
    pub name: Option<String>,
    /// Remaining fields of the listing response.
    pub attributes: Map<String, Value>,
}

impl ResourceRecord {
    /// Creates a record with no extra attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            attributes: Map::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Reads a string attribute.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Reads a boolean attribute, accepting `"true"`/`"false"` strings.
    #[must_use]
    pub fn attribute_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key)? {
            Value::Bool(flag) => Some(*flag),
            Value::String(raw) => raw.parse().ok(),
            _ => None,
        }
    }
}

/// Response of a creation call: a synchronous id, an asynchronous job id,
/// or both.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Submission {
    /// Identifier of the created entity, when returned up front.
    pub id: Option<String>,
    /// Identifier of the job completing the operation.
    pub job_id: Option<String>,
}

impl Submission {
    /// Result of a synchronous call.
    #[must_use]
    pub fn completed(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            job_id: None,
        }
    }

    /// Result of an asynchronous call.
    #[must_use]
    pub fn pending(id: Option<String>, job_id: impl Into<String>) -> Self {
        Self {
            id,
            job_id: Some(job_id.into()),
        }
    }
}

/// Payload of a successfully completed job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobResult(pub Value);

impl JobResult {
    /// Identifier of the entity the job created. Looks at the top level and
    /// then one object deep, matching responses such as
    /// `{"portforwardingrule": {"id": "..."}}`.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        let object = self.0.as_object()?;
        if let Some(id) = object.get("id").and_then(Value::as_str) {
            return Some(id);
        }
        object
            .values()
            .filter_map(Value::as_object)
            .find_map(|nested| nested.get("id").and_then(Value::as_str))
    }

    /// Finds the first string value stored under `key` anywhere in the
    /// payload.
    #[must_use]
    pub fn find_str(&self, key: &str) -> Option<&str> {
        find_str(&self.0, key)
    }
}

fn find_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    match value {
        Value::Object(object) => object
            .get(key)
            .and_then(Value::as_str)
            .or_else(|| object.values().find_map(|nested| find_str(nested, key))),
        Value::Array(items) => items.iter().find_map(|nested| find_str(nested, key)),
        _ => None,
    }
}

/// Outcome of a job status query.
#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    /// Job still running.
    Pending,
    /// Job finished successfully.
    Succeeded(JobResult),
    /// Job finished with an error.
    Failed {
        /// Failure detail reported by the control plane.
        message: String,
    },
}

/// Snapshot of an instance as reported by the control plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRecord {
    /// Instance identifier.
    pub id: String,
    /// Lifecycle state (for example `Starting`, `Running`).
    pub state: String,
    /// Primary NIC address, when assigned.
    pub ip_address: Option<String>,
    /// Whether the template lets the control plane generate a password.
    pub password_enabled: bool,
}

impl InstanceRecord {
    /// True once the instance reports the running state.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Create-instance request assembled from resolved identifiers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeployRequest {
    /// Zone identifier.
    pub zone_id: String,
    /// Template identifier.
    pub template_id: String,
    /// Service offering identifier.
    pub service_offering_id: String,
    /// Optional data disk offering.
    pub disk_offering_id: Option<String>,
    /// Networks to attach; empty in basic zones.
    pub network_ids: Vec<String>,
    /// Security groups to apply.
    pub security_group_ids: Vec<String>,
    /// SSH key pair registered with the control plane.
    pub key_pair: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// Instance group.
    pub group: Option<String>,
    /// Host name.
    pub name: Option<String>,
    /// User data passed to the guest.
    pub user_data: Option<String>,
    /// Requested private address.
    pub private_ip_address: Option<String>,
}

/// Create-port-forwarding-rule request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortForwardingRequest {
    /// Public IP address identifier.
    pub ip_address_id: String,
    /// Transport protocol.
    pub protocol: String,
    /// Public port.
    pub public_port: u16,
    /// Private port on the instance.
    pub private_port: u16,
    /// Whether the control plane should open its own firewall rule. Never
    /// sent for VPC tiers.
    pub open_firewall: Option<bool>,
    /// Target instance.
    pub virtual_machine_id: String,
    /// Network of the target NIC.
    pub network_id: Option<String>,
}

/// Port and ICMP selectors shared by firewall and ACL requests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrafficMatch {
    /// Transport protocol.
    pub protocol: String,
    /// Comma separated CIDR list.
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

/// Create-firewall-rule request for plain networks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirewallRequest {
    /// Public IP address identifier.
    pub ip_address_id: String,
    /// Traffic selector.
    pub traffic: TrafficMatch,
}

/// Create-network-ACL request for VPC tiers. Always an ingress allow rule.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkAclRequest {
    /// ACL list identifier of the tier.
    pub acl_id: String,
    /// Traffic selector.
    pub traffic: TrafficMatch,
}

/// Enable-static-NAT request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StaticNatRequest {
    /// Public IP address identifier to bind.
    pub ip_address_id: String,
    /// Target instance.
    pub virtual_machine_id: String,
    /// Network of the target NIC.
    pub network_id: Option<String>,
}

/// Direction of a security group rule.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Inbound traffic.
    Ingress,
    /// Outbound traffic.
    Egress,
}

/// Authorize-security-group-rule request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroupRuleRequest {
    /// Group the rule is added to.
    pub group_id: String,
    /// Ingress or egress.
    pub direction: Direction,
    /// Traffic selector.
    pub traffic: TrafficMatch,
}

/// Security group with the identifiers of its rules.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecurityGroupRecord {
    /// Group identifier.
    pub id: String,
    /// Group name.
    pub name: String,
    /// Ingress rule identifiers.
    pub ingress_rule_ids: Vec<String>,
    /// Egress rule identifiers.
    pub egress_rule_ids: Vec<String>,
}

/// Generated SSH key pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPair {
    /// Name registered with the control plane.
    pub name: String,
    /// PEM encoded private key.
    pub private_key: String,
}
