//! Name/identifier pairs for control-plane resources.

use std::fmt;

/// Kinds of control-plane entity that can be referenced by a handle.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// Availability zone.
    Zone,
    /// Guest network (plain or VPC tier).
    Network,
    /// Compute offering.
    ServiceOffering,
    /// Data disk offering.
    DiskOffering,
    /// Boot template.
    Template,
    /// Security group.
    SecurityGroup,
    /// Public IP address. The "name" of an address is its textual value.
    PublicIpAddress,
    /// Data volume.
    Volume,
}

impl ResourceKind {
    /// Human readable label used in logs and error messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Zone => "zone",
            Self::Network => "network",
            Self::ServiceOffering => "service offering",
            Self::DiskOffering => "disk offering",
            Self::Template => "template",
            Self::SecurityGroup => "security group",
            Self::PublicIpAddress => "public IP address",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Pairs a name and an identifier for one control-plane entity.
///
/// Either side may be missing. The resolver fills in whichever one the
/// caller did not know; blank strings count as missing.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResourceHandle {
    id: Option<String>,
    name: Option<String>,
    kind: ResourceKind,
}

impl ResourceHandle {
    /// Creates a handle from optional id and name, normalising blanks to
    /// `None`.
    #[must_use]
    pub fn new(kind: ResourceKind, id: Option<String>, name: Option<String>) -> Self {
        Self {
            id: normalise(id),
            name: normalise(name),
            kind,
        }
    }

    /// Creates a handle that knows neither id nor name.
    #[must_use]
    pub const fn undefined(kind: ResourceKind) -> Self {
        Self {
            id: None,
            name: None,
            kind,
        }
    }

    /// Creates a handle with only the identifier known.
    #[must_use]
    pub fn with_id(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::new(kind, Some(id.into()), None)
    }

    /// Creates a handle with only the name known.
    #[must_use]
    pub fn with_name(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::new(kind, None, Some(name.into()))
    }

    /// Identifier, when known.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Name, when known.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Kind of resource this handle denotes.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// True when neither id nor name is known.
    #[must_use]
    pub const fn is_undefined(&self) -> bool {
        self.id.is_none() && self.name.is_none()
    }

    /// True when both id and name are known.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.id.is_some() && self.name.is_some()
    }

    pub(crate) fn completed(&self, id: String, name: Option<String>) -> Self {
        Self::new(self.kind, Some(id), name.or_else(|| self.name.clone()))
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.id) {
            (Some(name), Some(id)) => write!(f, "{} '{name}' ({id})", self.kind),
            (Some(name), None) => write!(f, "{} '{name}'", self.kind),
            (None, Some(id)) => write!(f, "{} {id}", self.kind),
            (None, None) => write!(f, "undefined {}", self.kind),
        }
    }
}

fn normalise(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|trimmed| !trimmed.is_empty())
}
