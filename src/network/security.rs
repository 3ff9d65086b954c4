//! Security rule derivation.
//!
//! Reachability is declared on the resource that opens the connection; the
//! resulting rule is attached to the ingress set of the target only.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::subnet::SubnetLayout;
use crate::error::NetworkError;
use crate::resource::{ResourceDescriptor, ResourceId, Value};

/// Transport protocol of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
    /// Any protocol.
    All,
}

impl Protocol {
    /// Returns the lowercase protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::All => "all",
        }
    }
}

/// Inclusive range of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "PortSpec", into = "PortSpec")]
pub struct PortRange {
    /// First port.
    pub from: u16,
    /// Last port.
    pub to: u16,
}

/// Port range as written in a stack document: `5432` or `"8000-8080"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// A single port.
    Number(u16),
    /// A single port or a `from-to` range as text.
    Text(String),
}

impl PortRange {
    /// Creates a range covering one port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }

    /// Parses `"443"` or `"8000-8080"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid, non-empty range.
    pub fn parse(s: &str) -> Result<Self, String> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("Invalid port number: {p}"))
        };

        let range = match s.split_once('-') {
            Some((from, to)) => Self {
                from: parse_port(from)?,
                to: parse_port(to)?,
            },
            None => Self::single(parse_port(s)?),
        };

        if range.from == 0 || range.from > range.to {
            return Err(format!("Invalid port range: {s}"));
        }
        Ok(range)
    }
}

impl TryFrom<PortSpec> for PortRange {
    type Error = String;

    fn try_from(spec: PortSpec) -> Result<Self, Self::Error> {
        match spec {
            PortSpec::Number(0) => Err("Port 0 is not allowed".to_string()),
            PortSpec::Number(port) => Ok(Self::single(port)),
            PortSpec::Text(text) => Self::parse(&text),
        }
    }
}

impl From<PortRange> for PortSpec {
    fn from(range: PortRange) -> Self {
        if range.from == range.to {
            Self::Number(range.from)
        } else {
            Self::Text(range.to_string())
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

/// A declaration that the owning resource needs to reach `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reachability {
    /// Resource to reach.
    pub target: ResourceId,
    /// Destination ports.
    #[serde(rename = "port")]
    pub ports: PortRange,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
    /// Free-form description carried onto the rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Reachability {
    /// Creates a TCP reachability declaration for one port.
    #[must_use]
    pub fn tcp(target: impl Into<ResourceId>, port: u16) -> Self {
        Self {
            target: target.into(),
            ports: PortRange::single(port),
            protocol: Protocol::Tcp,
            description: None,
        }
    }
}

/// An inbound rule on `target` admitting traffic from `source`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecurityRule {
    /// Resource opening the connection.
    pub source: ResourceId,
    /// Resource receiving the connection.
    pub target: ResourceId,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Destination ports.
    pub ports: PortRange,
    /// Address blocks of the source's subnet tier, if it is placed in one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_cidrs: Vec<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SecurityRule {
    /// Renders the rule as the property value handed to providers.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::from([
            ("source".to_string(), Value::from(self.source.as_str())),
            ("protocol".to_string(), Value::from(self.protocol.as_str())),
            ("from_port".to_string(), Value::Integer(i64::from(self.ports.from))),
            ("to_port".to_string(), Value::Integer(i64::from(self.ports.to))),
        ]);
        if !self.source_cidrs.is_empty() {
            map.insert("source_cidrs".to_string(), Value::from(self.source_cidrs.clone()));
        }
        if let Some(description) = &self.description {
            map.insert("description".to_string(), Value::from(description.as_str()));
        }
        Value::Map(map)
    }
}

impl fmt::Display for SecurityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {}/{}",
            self.source,
            self.target,
            self.protocol.as_str(),
            self.ports
        )
    }
}

/// Derives the ingress rules of every target from the reachability
/// declarations of its peers.
///
/// # Errors
///
/// Returns an error if a declaration names an undeclared target, targets its
/// own resource, originates from a type that cannot open connections, or
/// targets a type without an ingress rule set.
pub fn derive_security_rules(
    descriptors: &[ResourceDescriptor],
    layout: Option<&SubnetLayout>,
) -> Result<BTreeMap<ResourceId, Vec<SecurityRule>>, NetworkError> {
    let by_id: BTreeMap<&ResourceId, &ResourceDescriptor> =
        descriptors.iter().map(|d| (&d.id, d)).collect();
    let mut rules: BTreeMap<ResourceId, BTreeSet<SecurityRule>> = BTreeMap::new();

    for source in descriptors {
        for reach in &source.reachability {
            let invalid = |reason: &str| NetworkError::InvalidRule {
                source_id: source.id.clone(),
                target: reach.target.clone(),
                reason: reason.to_string(),
            };

            let target = by_id
                .get(&reach.target)
                .ok_or_else(|| invalid("target is not declared"))?;
            if target.id == source.id {
                return Err(invalid("a resource cannot grant ingress to itself"));
            }
            if !source.resource_type.can_originate_traffic() {
                return Err(invalid(&format!(
                    "{} resources cannot open outbound connections",
                    source.resource_type
                )));
            }
            if !target.resource_type.accepts_ingress() {
                return Err(invalid(&format!(
                    "{} resources have no ingress rules",
                    target.resource_type
                )));
            }

            let source_cidrs = match (source.placement, layout) {
                (Some(tier), Some(layout)) => layout.cidrs_for(tier),
                _ => Vec::new(),
            };

            rules.entry(target.id.clone()).or_default().insert(SecurityRule {
                source: source.id.clone(),
                target: target.id.clone(),
                protocol: reach.protocol,
                ports: reach.ports,
                source_cidrs,
                description: reach.description.clone(),
            });
        }
    }

    Ok(rules
        .into_iter()
        .map(|(id, set)| (id, set.into_iter().collect()))
        .collect())
}
