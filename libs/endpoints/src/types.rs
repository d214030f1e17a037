use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference to the object backing an address (usually a pod).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<ObjectReference>,
}

/// Identity of an address inside a subset: `(ip, podUID)`.
pub type AddressKey = (String, Option<String>);

impl EndpointAddress {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            hostname: None,
            node_name: None,
            target_ref: None,
        }
    }

    pub fn with_target_uid(mut self, uid: impl Into<String>) -> Self {
        self.target_ref = Some(ObjectReference {
            kind: "Pod".to_string(),
            namespace: String::new(),
            name: String::new(),
            uid: uid.into(),
        });
        self
    }

    pub fn uid(&self) -> Option<&str> {
        self.target_ref.as_ref().map(|r| r.uid.as_str())
    }

    pub fn key(&self) -> AddressKey {
        (self.ip.clone(), self.uid().map(str::to_string))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Sctp => write!(f, "SCTP"),
        }
    }
}

/// Ports order by `(name, port, protocol)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointPort {
    pub name: String,
    pub port: i32,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
}

impl EndpointPort {
    pub fn tcp(name: impl Into<String>, port: i32) -> Self {
        Self {
            name: name.into(),
            port,
            protocol: Protocol::Tcp,
            app_protocol: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub not_ready_addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
    #[serde(default)]
    pub service_group_id: String,
}

impl EndpointSubset {
    /// First address by sort order, ready addresses first.
    pub fn first_address(&self) -> Option<&EndpointAddress> {
        self.addresses
            .first()
            .or_else(|| self.not_ready_addresses.first())
    }

    pub fn has_addresses(&self) -> bool {
        !self.addresses.is_empty() || !self.not_ready_addresses.is_empty()
    }
}

/// The bootstrap `Endpoints` object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
    /// Optimistic-concurrency token assigned by the registry; 0 before create.
    #[serde(default)]
    pub resource_version: u64,
}

impl Endpoints {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            subsets: Vec::new(),
            resource_version: 0,
        }
    }

    /// Split subsets into those belonging to `group` and the rest.
    pub fn partition_by_group(&self, group: &str) -> (Vec<&EndpointSubset>, Vec<&EndpointSubset>) {
        self.subsets
            .iter()
            .partition(|s| s.service_group_id == group)
    }
}
