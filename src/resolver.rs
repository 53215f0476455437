//! Resolution of human-given names to control-plane identifiers and back.

use thiserror::Error;
use tracing::debug;

use crate::control_plane::{ControlPlane, ControlPlaneError, ListFilter, ResourceRecord};
use crate::handle::{ResourceHandle, ResourceKind};

const ACL_ID_ATTRIBUTE: &str = "aclid";
const VPC_ID_ATTRIBUTE: &str = "vpcid";

/// Errors raised while resolving handles.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    /// No entity matched the given id or name.
    #[error("{kind} with {field} '{value}' not found")]
    NotFound {
        /// Kind of resource looked up.
        kind: ResourceKind,
        /// Field that was compared (`id` or `name`).
        field: &'static str,
        /// Value used for the lookup.
        value: String,
    },
    /// The handle carried neither id nor name but a record was required.
    #[error("{kind} must be specified by id or name")]
    Undefined {
        /// Kind of resource that was left unspecified.
        kind: ResourceKind,
    },
    /// The listing call failed.
    #[error("failed to list {kind}: {source}")]
    Lookup {
        /// Kind of resource being listed.
        kind: ResourceKind,
        /// Underlying control-plane error.
        source: ControlPlaneError,
    },
}

/// Resolved guest network with its VPC wiring.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedNetwork {
    /// Completed handle; undefined when no network was requested.
    pub handle: ResourceHandle,
    /// ACL list id; present only for VPC tiers.
    pub acl_id: Option<String>,
    /// VPC id; present only for VPC tiers.
    pub vpc_id: Option<String>,
}

impl ResolvedNetwork {
    /// A network reference that was not requested.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            handle: ResourceHandle::undefined(ResourceKind::Network),
            acl_id: None,
            vpc_id: None,
        }
    }

    /// True for VPC tiers, which take ACL rules instead of firewall rules.
    #[must_use]
    pub const fn is_vpc(&self) -> bool {
        self.acl_id.is_some()
    }
}

/// Fills in the missing side of resource handles using listing calls.
///
/// The resolver holds no state between calls.
#[derive(Debug)]
pub struct Resolver<'a, C: ?Sized> {
    client: &'a C,
}

impl<'a, C> Resolver<'a, C>
where
    C: ControlPlane + ?Sized,
{
    /// Creates a resolver over `client`.
    #[must_use]
    pub const fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Default listing filter for `kind`, scoped to `zone_id` when the kind
    /// lives in a zone.
    #[must_use]
    pub fn default_filter(kind: ResourceKind, zone_id: Option<&str>) -> ListFilter {
        let base = match kind {
            ResourceKind::Template => ListFilter::new().with("templatefilter", "executable"),
            ResourceKind::SecurityGroup | ResourceKind::PublicIpAddress => {
                ListFilter::new().with("listall", "true")
            }
            _ => ListFilter::new(),
        };
        match (kind, zone_id) {
            (
                ResourceKind::Network
                | ResourceKind::Template
                | ResourceKind::PublicIpAddress
                | ResourceKind::Volume,
                Some(zone),
            ) => base.with("zoneid", zone),
            _ => base,
        }
    }

    /// Completes `handle`.
    ///
    /// Undefined handles and handles that already carry both fields are
    /// returned unchanged without calling the control plane.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::NotFound`] when no entity matches, or
    /// [`ResolveError::Lookup`] when listing fails.
    pub async fn resolve(
        &self,
        handle: &ResourceHandle,
        filter: &ListFilter,
    ) -> Result<ResourceHandle, ResolveError> {
        if handle.is_undefined() || handle.is_complete() {
            return Ok(handle.clone());
        }

        let record = self.describe(handle, filter).await?;
        let completed = handle.completed(record.id, record.name);
        debug!(resource = %completed, "resolved");
        Ok(completed)
    }

    /// Completes a network handle and extracts its VPC ACL id.
    ///
    /// # Errors
    ///
    /// As [`Resolver::resolve`].
    pub async fn resolve_network(
        &self,
        handle: &ResourceHandle,
        filter: &ListFilter,
    ) -> Result<ResolvedNetwork, ResolveError> {
        if handle.is_undefined() {
            return Ok(ResolvedNetwork::none());
        }

        let record = self.describe(handle, filter).await?;
        let acl_id = record.attribute_str(ACL_ID_ATTRIBUTE).map(str::to_owned);
        let vpc_id = record.attribute_str(VPC_ID_ATTRIBUTE).map(str::to_owned);
        Ok(ResolvedNetwork {
            handle: handle.completed(record.id, record.name),
            acl_id,
            vpc_id,
        })
    }

    /// Fetches the full listing record for `handle`, preferring the id.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Undefined`] for undefined handles, otherwise
    /// as [`Resolver::resolve`].
    pub async fn describe(
        &self,
        handle: &ResourceHandle,
        filter: &ListFilter,
    ) -> Result<ResourceRecord, ResolveError> {
        let kind = handle.kind();
        if let Some(id) = handle.id() {
            return self
                .find(kind, filter.clone().with("id", id), LookupField::Id, id)
                .await;
        }
        if let Some(name) = handle.name() {
            let key = name_filter_key(kind);
            return self
                .find(kind, filter.clone().with(key, name), LookupField::Name, name)
                .await;
        }
        Err(ResolveError::Undefined { kind })
    }

    async fn find(
        &self,
        kind: ResourceKind,
        filter: ListFilter,
        field: LookupField,
        value: &str,
    ) -> Result<ResourceRecord, ResolveError> {
        let records = self
            .client
            .list_resources(kind, &filter)
            .await
            .map_err(|source| ResolveError::Lookup { kind, source })?;

        records
            .into_iter()
            .find(|record| match field {
                LookupField::Id => record.id == value,
                LookupField::Name => record.name.as_deref() == Some(value),
            })
            .ok_or_else(|| ResolveError::NotFound {
                kind,
                field: field.label(),
                value: value.to_owned(),
            })
    }
}

#[derive(Clone, Copy, Debug)]
enum LookupField {
    Id,
    Name,
}

impl LookupField {
    const fn label(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
        }
    }
}

const fn name_filter_key(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::PublicIpAddress => "ipaddress",
        _ => "name",
    }
}
