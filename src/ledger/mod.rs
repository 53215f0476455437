//! Durable record of every side effect created for one instance.
//!
//! The ledger is append-only per key: provisioning appends an identifier
//! after the matching create call succeeded, teardown reads the list back
//! and removes the key once everything under it is gone. Storage is
//! abstracted behind [`LedgerStore`] so files, databases, or memory can
//! back the same contract.

mod file;
mod memory;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::control_plane::KeyPair;
use crate::rules::Channel;

pub use file::FileLedgerStore;
pub use memory::MemoryLedgerStore;

/// Keys under which side effects are recorded.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LedgerKey {
    /// Firewall and network ACL rules, stored as `id,type`.
    Firewall,
    /// Port forwarding rule ids.
    PortForwarding,
    /// Public IP ids bound with static NAT.
    StaticNat,
    /// Security groups created for the instance.
    SecurityGroups,
    /// Data volumes attached to the instance.
    Volumes,
    /// Private key of a generated SSH key pair.
    SshKeyFile,
    /// Name of a generated SSH key pair.
    SshKeyName,
    /// Password generated by the control plane.
    VmCredentials,
    /// Allocated public port of the ssh/winrm channel.
    PublicPort,
    /// Allocated public port of the RDP channel.
    PublicRdpPort,
    /// Instance identifier.
    InstanceId,
}

impl LedgerKey {
    /// Every key, in teardown order followed by the instance id.
    pub const ALL: [Self; 11] = [
        Self::Firewall,
        Self::StaticNat,
        Self::PortForwarding,
        Self::PublicPort,
        Self::PublicRdpPort,
        Self::Volumes,
        Self::VmCredentials,
        Self::SshKeyName,
        Self::SshKeyFile,
        Self::SecurityGroups,
        Self::InstanceId,
    ];

    /// Name of the record, also used as the file name by
    /// [`FileLedgerStore`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Firewall => "firewall",
            Self::PortForwarding => "port_forwarding",
            Self::StaticNat => "static_nat",
            Self::SecurityGroups => "security_groups",
            Self::Volumes => "volumes",
            Self::SshKeyFile => "sshkeyfile",
            Self::SshKeyName => "sshkeyname",
            Self::VmCredentials => "vmcredentials",
            Self::PublicPort => "pf_public_port",
            Self::PublicRdpPort => "pf_public_rdp_port",
            Self::InstanceId => "id",
        }
    }

    /// Key holding the allocated public port of `channel`.
    #[must_use]
    pub const fn public_port(channel: Channel) -> Self {
        match channel {
            Channel::Ssh => Self::PublicPort,
            Channel::Rdp => Self::PublicRdpPort,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by ledger storage.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LedgerError {
    /// The backing store could not be read or written.
    #[error("failed to access ledger record {key} at {location}: {message}")]
    Io {
        /// Record being accessed.
        key: LedgerKey,
        /// Location of the store, for example a directory path.
        location: String,
        /// Human-readable error message.
        message: String,
    },
    /// A stored entry could not be interpreted.
    #[error("corrupt ledger record {key}: {message}")]
    Corrupt {
        /// Record holding the entry.
        key: LedgerKey,
        /// Description of the problem.
        message: String,
    },
}

/// Key/value persistence backing a [`Ledger`].
pub trait LedgerStore: Send + Sync {
    /// Returns the entries recorded under `key`, oldest first. Missing
    /// records read as empty.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] when the store cannot be read.
    fn read(&self, key: LedgerKey) -> Result<Vec<String>, LedgerError>;

    /// Appends one entry under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] when the store cannot be written.
    fn append(&self, key: LedgerKey, entry: &str) -> Result<(), LedgerError>;

    /// Deletes every entry under `key`. Removing a missing record succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] when the store cannot be written.
    fn remove(&self, key: LedgerKey) -> Result<(), LedgerError>;
}

/// Type of a recorded firewall entry, selecting the delete operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FirewallRuleKind {
    /// Firewall rule on a public IP.
    FirewallRule,
    /// ACL rule on a VPC tier.
    NetworkAcl,
}

impl FirewallRuleKind {
    /// Tag written after the id in the ledger.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::FirewallRule => "firewallrule",
            Self::NetworkAcl => "networkacl",
        }
    }
}

impl FromStr for FirewallRuleKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "firewallrule" => Ok(Self::FirewallRule),
            "networkacl" => Ok(Self::NetworkAcl),
            other => Err(format!("unknown firewall rule type '{other}'")),
        }
    }
}

/// Firewall entry: rule id plus the tag that says how to delete it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FirewallRecord {
    /// Rule identifier.
    pub id: String,
    /// Kind of rule.
    pub kind: FirewallRuleKind,
}

impl FirewallRecord {
    fn encode(&self) -> String {
        format!("{},{}", self.id, self.kind.tag())
    }

    fn decode(line: &str) -> Result<Self, LedgerError> {
        let (id, tag) = line.split_once(',').ok_or_else(|| LedgerError::Corrupt {
            key: LedgerKey::Firewall,
            message: format!("entry '{line}' is missing its type tag"),
        })?;
        let kind = tag.parse().map_err(|message| LedgerError::Corrupt {
            key: LedgerKey::Firewall,
            message,
        })?;
        Ok(Self {
            id: id.trim().to_owned(),
            kind,
        })
    }
}

/// Typed view over a [`LedgerStore`] used by the orchestrators.
#[derive(Clone, Debug)]
pub struct Ledger<S> {
    store: S,
}

impl<S: LedgerStore> Ledger<S> {
    /// Wraps `store`.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Recorded instance id; `None` means not created or destroyed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn instance_id(&self) -> Result<Option<String>, LedgerError> {
        self.single(LedgerKey::InstanceId)
    }

    /// Records the instance id.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn record_instance_id(&self, id: &str) -> Result<(), LedgerError> {
        self.replace(LedgerKey::InstanceId, id)
    }

    /// Marks the instance as destroyed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn clear_instance_id(&self) -> Result<(), LedgerError> {
        self.store.remove(LedgerKey::InstanceId)
    }

    /// Recorded firewall entries.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupt`] for entries without a valid tag.
    pub fn firewall_rules(&self) -> Result<Vec<FirewallRecord>, LedgerError> {
        self.store
            .read(LedgerKey::Firewall)?
            .iter()
            .map(|line| FirewallRecord::decode(line))
            .collect()
    }

    /// Appends a firewall entry.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn record_firewall_rule(&self, record: &FirewallRecord) -> Result<(), LedgerError> {
        self.store.append(LedgerKey::Firewall, &record.encode())
    }

    /// Recorded entries under a list key.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn entries(&self, key: LedgerKey) -> Result<Vec<String>, LedgerError> {
        self.store.read(key)
    }

    /// Appends an identifier under a list key.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn record(&self, key: LedgerKey, id: &str) -> Result<(), LedgerError> {
        self.store.append(key, id)
    }

    /// Deletes everything under `key`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn clear(&self, key: LedgerKey) -> Result<(), LedgerError> {
        self.store.remove(key)
    }

    /// Allocated public port of `channel`, if one was persisted.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupt`] when the entry is not a port.
    pub fn public_port(&self, channel: Channel) -> Result<Option<u16>, LedgerError> {
        let key = LedgerKey::public_port(channel);
        self.single(key)?
            .map(|raw| {
                raw.trim().parse::<u16>().map_err(|err| LedgerError::Corrupt {
                    key,
                    message: format!("'{raw}' is not a port: {err}"),
                })
            })
            .transpose()
    }

    /// Persists the allocated public port of `channel`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn record_public_port(&self, channel: Channel, port: u16) -> Result<(), LedgerError> {
        self.replace(LedgerKey::public_port(channel), &port.to_string())
    }

    /// Generated key pair, when both its name and key were recorded.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn ssh_key_pair(&self) -> Result<Option<KeyPair>, LedgerError> {
        let name = self.single(LedgerKey::SshKeyName)?;
        let private_key = self.single(LedgerKey::SshKeyFile)?;
        Ok(name.zip(private_key).map(|(key_name, key)| KeyPair {
            name: key_name,
            private_key: key,
        }))
    }

    /// Records a generated key pair.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn record_ssh_key_pair(&self, key_pair: &KeyPair) -> Result<(), LedgerError> {
        self.replace(LedgerKey::SshKeyName, &key_pair.name)?;
        self.replace(LedgerKey::SshKeyFile, &key_pair.private_key)
    }

    /// Name of the generated key pair.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn ssh_key_name(&self) -> Result<Option<String>, LedgerError> {
        self.single(LedgerKey::SshKeyName)
    }

    /// Generated guest password.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn credentials(&self) -> Result<Option<String>, LedgerError> {
        self.single(LedgerKey::VmCredentials)
    }

    /// Records the generated guest password.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn record_credentials(&self, password: &str) -> Result<(), LedgerError> {
        self.replace(LedgerKey::VmCredentials, password)
    }

    fn single(&self, key: LedgerKey) -> Result<Option<String>, LedgerError> {
        let lines = self.store.read(key)?;
        if lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(lines.join("\n")).filter(|value| !value.trim().is_empty()))
    }

    fn replace(&self, key: LedgerKey, value: &str) -> Result<(), LedgerError> {
        self.store.remove(key)?;
        self.store.append(key, value)
    }
}
