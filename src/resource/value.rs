//! Property values and cross-resource references.
//!
//! A property value is either a literal or a [`Reference`] to an attribute
//! another resource publishes once it is provisioned. In YAML a reference is
//! written `{ref: "database.endpoint"}` and a string built from several
//! values is written `{join: ["https://", {ref: "cdn.domain_name"}]}`.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::ResourceId;
use crate::error::ConfigError;

/// Attributes published by a provisioned resource.
pub type Attributes = BTreeMap<String, Value>;

/// A descriptor property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Integer(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal.
    String(String),
    /// Reference to another resource's attribute.
    Reference(Reference),
    /// Concatenation of scalar values.
    Join(Join),
    /// List of values.
    List(Vec<Value>),
    /// Map of values.
    Map(BTreeMap<String, Value>),
}

/// A reference to an attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// The producing resource.
    pub resource: ResourceId,
    /// Attribute name followed by an optional path into map values.
    pub path: Vec<String>,
}

/// Concatenation of values into one string once every part is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Parts, joined without separator.
    pub parts: Vec<Value>,
}

impl Reference {
    /// Creates a reference to a top-level attribute.
    #[must_use]
    pub fn new(resource: impl Into<ResourceId>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            path: vec![attribute.into()],
        }
    }

    /// Returns the top-level attribute name.
    #[must_use]
    pub fn attribute(&self) -> &str {
        self.path.first().map_or("", String::as_str)
    }
}

impl FromStr for Reference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = s.split('.');
        let resource = segments
            .next()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| invalid("missing resource id"))?;
        let path: Vec<String> = segments.map(str::to_string).collect();

        if path.is_empty() {
            return Err(invalid("expected <resource>.<attribute>"));
        }
        if path.iter().any(String::is_empty) {
            return Err(invalid("empty attribute segment"));
        }

        Ok(Self {
            resource: ResourceId::from(resource),
            path,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.path.join("."))
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("ref", &self.to_string())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Repr {
            #[serde(rename = "ref")]
            target: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        repr.target.parse().map_err(D::Error::custom)
    }
}

impl Serialize for Join {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("join", &self.parts)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Join {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Repr {
            join: Vec<Value>,
        }

        let repr = Repr::deserialize(deserializer)?;
        Ok(Self { parts: repr.join })
    }
}

impl Value {
    /// Creates a reference value.
    #[must_use]
    pub fn reference(resource: impl Into<ResourceId>, attribute: impl Into<String>) -> Self {
        Self::Reference(Reference::new(resource, attribute))
    }

    /// Returns true if the value is a literal with no references anywhere inside.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        let mut found = Vec::new();
        self.collect_references("", &mut found);
        found.is_empty()
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Renders a scalar as the text a join would produce.
    #[must_use]
    pub fn to_join_text(&self) -> Option<String> {
        match self {
            Self::Null => Some(String::new()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Follows a path of map keys.
    #[must_use]
    pub fn lookup(&self, path: &[String]) -> Option<&Self> {
        path.iter().try_fold(self, |current, key| match current {
            Self::Map(map) => map.get(key),
            _ => None,
        })
    }

    /// Collects every reference inside this value with the property path
    /// where it appears.
    pub fn collect_references<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Reference)>) {
        match self {
            Self::Reference(reference) => out.push((path.to_string(), reference)),
            Self::Join(join) => {
                for (i, part) in join.parts.iter().enumerate() {
                    part.collect_references(&format!("{path}[{i}]"), out);
                }
            }
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_references(&format!("{path}[{i}]"), out);
                }
            }
            Self::Map(map) => {
                for (key, item) in map {
                    item.collect_references(&format!("{path}.{key}"), out);
                }
            }
            Self::Null | Self::Bool(_) | Self::Integer(_) | Self::Float(_) | Self::String(_) => {}
        }
    }

    /// Returns the first map inside this value that looks like a malformed
    /// `ref` or `join` form, with its property path.
    #[must_use]
    pub fn find_malformed_form(&self, path: &str) -> Option<String> {
        match self {
            Self::Map(map) => {
                if map.contains_key("ref") || map.contains_key("join") {
                    return Some(path.to_string());
                }
                map.iter()
                    .find_map(|(key, item)| item.find_malformed_form(&format!("{path}.{key}")))
            }
            Self::List(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| item.find_malformed_form(&format!("{path}[{i}]"))),
            Self::Join(join) => join
                .parts
                .iter()
                .enumerate()
                .find_map(|(i, item)| item.find_malformed_form(&format!("{path}[{i}]"))),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Reference(r) => write!(f, "${{{r}}}"),
            Self::Join(_) | Self::List(_) | Self::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                write!(f, "{json}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Reference(r)
    }
}

impl<V: Into<Self>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let r: Reference = "database.endpoint".parse().unwrap();
        assert_eq!(r.resource.as_str(), "database");
        assert_eq!(r.attribute(), "endpoint");

        let nested: Reference = "database.endpoint.port".parse().unwrap();
        assert_eq!(nested.path, vec!["endpoint".to_string(), "port".to_string()]);
        assert_eq!(nested.to_string(), "database.endpoint.port");
    }

    #[test]
    fn test_parse_reference_invalid() {
        assert!("database".parse::<Reference>().is_err());
        assert!(".endpoint".parse::<Reference>().is_err());
        assert!("database..port".parse::<Reference>().is_err());
    }

    #[test]
    fn test_yaml_forms() {
        let yaml = r#"
port: 5432
ratio: 0.5
enabled: true
name: api
endpoint:
  ref: database.endpoint
url:
  join: ["https://", { ref: cdn.domain_name }, "/graphql"]
tags:
  team: platform
"#;
        let props: BTreeMap<String, Value> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(props["port"], Value::Integer(5432));
        assert_eq!(props["ratio"], Value::Float(0.5));
        assert_eq!(props["enabled"], Value::Bool(true));
        assert_eq!(props["endpoint"], Value::reference("database", "endpoint"));
        assert!(matches!(&props["url"], Value::Join(j) if j.parts.len() == 3));
        assert!(matches!(&props["tags"], Value::Map(_)));
    }

    #[test]
    fn test_collect_references_nested() {
        let value = Value::Map(BTreeMap::from([
            ("a".to_string(), Value::reference("db", "endpoint")),
            (
                "b".to_string(),
                Value::List(vec![Value::Join(Join {
                    parts: vec![Value::from("x"), Value::reference("cdn", "domain")],
                })]),
            ),
        ]));

        let mut refs = Vec::new();
        value.collect_references("env", &mut refs);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0, "env.a");
        assert_eq!(refs[1].0, "env.b[0][1]");
        assert!(!value.is_literal());
    }

    #[test]
    fn test_malformed_ref_detected() {
        let yaml = "{ ref: nodot }";
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(value, Value::Map(_)));
        assert_eq!(value.find_malformed_form("p"), Some("p".to_string()));
    }

    #[test]
    fn test_lookup_path() {
        let value = Value::Map(BTreeMap::from([(
            "endpoint".to_string(),
            Value::Map(BTreeMap::from([("port".to_string(), Value::Integer(5432))])),
        )]));
        let path = vec!["endpoint".to_string(), "port".to_string()];
        assert_eq!(value.lookup(&path), Some(&Value::Integer(5432)));
        assert_eq!(value.lookup(&["missing".to_string()]), None);
    }
}
