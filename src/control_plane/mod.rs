//! Abstraction over the cloud control plane.
//!
//! The wire protocol is out of scope; orchestrators only see this trait.
//! Creation calls answer with a [`Submission`] and the presence of a job id
//! tells the caller whether the operation still has to be awaited.

mod error;
mod types;

use std::future::Future;
use std::pin::Pin;

use crate::handle::ResourceKind;

pub use error::ControlPlaneError;
pub use types::{
    DeployRequest, Direction, FirewallRequest, InstanceRecord, JobResult, JobStatus, KeyPair,
    ListFilter, NetworkAclRequest, PortForwardingRequest, ResourceRecord, SecurityGroupRecord,
    SecurityGroupRuleRequest, StaticNatRequest, Submission, TrafficMatch,
};

/// Future returned by control-plane operations.
pub type ControlPlaneFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ControlPlaneError>> + Send + 'a>>;

/// RPC surface of the control plane consumed by the orchestrators.
pub trait ControlPlane: Send + Sync {
    /// Lists resources of `kind` matching `filter`.
    fn list_resources<'a>(
        &'a self,
        kind: ResourceKind,
        filter: &'a ListFilter,
    ) -> ControlPlaneFuture<'a, Vec<ResourceRecord>>;

    /// Submits a create-instance request.
    fn create_instance<'a>(&'a self, request: &'a DeployRequest)
    -> ControlPlaneFuture<'a, Submission>;

    /// Fetches an instance, returning `None` when it does not exist.
    fn get_instance<'a>(&'a self, id: &'a str) -> ControlPlaneFuture<'a, Option<InstanceRecord>>;

    /// Destroys an instance, optionally expunging it.
    fn destroy_instance<'a>(&'a self, id: &'a str, expunge: bool)
    -> ControlPlaneFuture<'a, Submission>;

    /// Creates a port forwarding rule.
    fn create_port_forwarding_rule<'a>(
        &'a self,
        request: &'a PortForwardingRequest,
    ) -> ControlPlaneFuture<'a, Submission>;

    /// Deletes a port forwarding rule.
    fn delete_port_forwarding_rule<'a>(&'a self, id: &'a str) -> ControlPlaneFuture<'a, Submission>;

    /// Creates a firewall rule on a public IP of a plain network.
    fn create_firewall_rule<'a>(
        &'a self,
        request: &'a FirewallRequest,
    ) -> ControlPlaneFuture<'a, Submission>;

    /// Deletes a firewall rule.
    fn delete_firewall_rule<'a>(&'a self, id: &'a str) -> ControlPlaneFuture<'a, Submission>;

    /// Creates an ACL rule on a VPC tier.
    fn create_network_acl<'a>(
        &'a self,
        request: &'a NetworkAclRequest,
    ) -> ControlPlaneFuture<'a, Submission>;

    /// Deletes an ACL rule.
    fn delete_network_acl<'a>(&'a self, id: &'a str) -> ControlPlaneFuture<'a, Submission>;

    /// Binds a public IP to an instance.
    fn enable_static_nat<'a>(
        &'a self,
        request: &'a StaticNatRequest,
    ) -> ControlPlaneFuture<'a, Submission>;

    /// Releases the static NAT binding of a public IP.
    fn disable_static_nat<'a>(&'a self, ip_address_id: &'a str)
    -> ControlPlaneFuture<'a, Submission>;

    /// Creates a security group.
    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: Option<&'a str>,
    ) -> ControlPlaneFuture<'a, Submission>;

    /// Fetches a security group with its rule identifiers.
    fn get_security_group<'a>(
        &'a self,
        id: &'a str,
    ) -> ControlPlaneFuture<'a, Option<SecurityGroupRecord>>;

    /// Adds an ingress or egress rule to a security group.
    fn authorize_security_group_rule<'a>(
        &'a self,
        request: &'a SecurityGroupRuleRequest,
    ) -> ControlPlaneFuture<'a, Submission>;

    /// Revokes an ingress or egress rule.
    fn revoke_security_group_rule<'a>(
        &'a self,
        direction: Direction,
        rule_id: &'a str,
    ) -> ControlPlaneFuture<'a, Submission>;

    /// Deletes a security group.
    fn delete_security_group<'a>(&'a self, id: &'a str) -> ControlPlaneFuture<'a, ()>;

    /// Generates and registers an SSH key pair.
    fn create_ssh_key_pair<'a>(&'a self, name: &'a str) -> ControlPlaneFuture<'a, KeyPair>;

    /// Deletes a registered SSH key pair.
    fn delete_ssh_key_pair<'a>(&'a self, name: &'a str) -> ControlPlaneFuture<'a, ()>;

    /// Detaches a data volume from its instance.
    fn detach_volume<'a>(&'a self, id: &'a str) -> ControlPlaneFuture<'a, Submission>;

    /// Deletes a detached data volume.
    fn delete_volume<'a>(&'a self, id: &'a str) -> ControlPlaneFuture<'a, ()>;

    /// Queries the status of an asynchronous job.
    fn query_job<'a>(&'a self, job_id: &'a str) -> ControlPlaneFuture<'a, JobStatus>;
}
