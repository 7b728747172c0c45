use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SUBSCRIPTIONS: &str = "subscriptions";
const RESOURCE_GROUPS: &str = "resourceGroups";
const PROVIDERS: &str = "providers";

/// The identifier text could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed resource identifier {raw:?}: {reason}")]
pub struct MalformedIdentifier {
    pub raw: String,
    pub reason: String,
}

impl MalformedIdentifier {
    fn new(raw: &str, reason: impl Into<String>) -> Self {
        MalformedIdentifier {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// The expected shape of the identifiers of one resource type.
///
/// `type_keys` lists the typed segments from the outermost parent down to the
/// resource itself, so `["managedClusters", "agentPools"]` describes
/// `/subscriptions/{s}/resourceGroups/{g}/providers/Microsoft.ContainerService/managedClusters/{c}/agentPools/{n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdTemplate {
    pub namespace: &'static str,
    pub type_keys: &'static [&'static str],
}

impl IdTemplate {
    pub const fn new(namespace: &'static str, type_keys: &'static [&'static str]) -> Self {
        IdTemplate {
            namespace,
            type_keys,
        }
    }

    /// Parse `raw`, requiring it to match this template. Literal keys are
    /// matched without regard to case; the result carries the template's
    /// canonical casing.
    pub fn parse(&self, raw: &str) -> Result<ResourceIdentifier, MalformedIdentifier> {
        let parts = split(raw)?;
        let expected = 6 + 2 * self.type_keys.len();
        if parts.len() != expected {
            return Err(MalformedIdentifier::new(
                raw,
                format!(
                    "expected {} path segments for {}, got {}",
                    expected,
                    self,
                    parts.len()
                ),
            ));
        }
        let (subscription_id, resource_group, namespace) = prefix(raw, &parts)?;
        if !namespace.eq_ignore_ascii_case(self.namespace) {
            return Err(MalformedIdentifier::new(
                raw,
                format!("expected provider {}, got {}", self.namespace, namespace),
            ));
        }
        let mut segments = Vec::with_capacity(self.type_keys.len());
        for (pair, key) in parts[6..].chunks(2).zip(self.type_keys) {
            if !pair[0].eq_ignore_ascii_case(key) {
                return Err(MalformedIdentifier::new(
                    raw,
                    format!("expected segment key {}, got {}", key, pair[0]),
                ));
            }
            segments.push(Segment {
                key: key.to_string(),
                name: pair[1].to_string(),
            });
        }
        ResourceIdentifier::from_segments(subscription_id, resource_group, self.namespace, segments)
            .ok_or_else(|| MalformedIdentifier::new(raw, "no resource segment"))
    }

    /// Build an identifier of this shape from its names, outermost parent first.
    pub fn id(
        &self,
        subscription_id: &str,
        resource_group: &str,
        names: &[&str],
    ) -> Result<ResourceIdentifier, MalformedIdentifier> {
        if names.len() != self.type_keys.len() {
            return Err(MalformedIdentifier::new(
                &names.join("/"),
                format!("{} expects {} names", self, self.type_keys.len()),
            ));
        }
        let segments = self
            .type_keys
            .iter()
            .zip(names)
            .map(|(key, name)| Segment {
                key: key.to_string(),
                name: name.to_string(),
            })
            .collect::<Vec<_>>();
        let id = ResourceIdentifier::from_segments(
            subscription_id.to_string(),
            resource_group.to_string(),
            self.namespace,
            segments,
        )
        .ok_or_else(|| MalformedIdentifier::new("", "no resource segment"))?;
        // Names must survive a round trip through the path form.
        self.parse(&id.to_string())
    }

    /// The template of the parent resource, if this type is nested.
    pub fn parent(&self) -> Option<IdTemplate> {
        match self.type_keys.len() {
            0 | 1 => None,
            n => Some(IdTemplate::new(self.namespace, &self.type_keys[..n - 1])),
        }
    }
}

impl Display for IdTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace)?;
        for key in self.type_keys {
            write!(f, "/{}", key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub key: String,
    pub name: String,
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.key.eq_ignore_ascii_case(&other.key) && self.name == other.name
    }
}
impl Eq for Segment {}

/// A structured resource identifier.
///
/// Equality and hashing ignore the casing of the literal keys (provider
/// namespace and segment keys), but not of the names.
#[derive(Debug, Clone)]
pub struct ResourceIdentifier {
    pub subscription_id: String,
    pub resource_group: String,
    pub namespace: String,
    /// Enclosing resources, outermost first.
    pub parent_path: Vec<Segment>,
    pub type_key: String,
    pub name: String,
}

impl ResourceIdentifier {
    fn from_segments(
        subscription_id: String,
        resource_group: String,
        namespace: &str,
        mut segments: Vec<Segment>,
    ) -> Option<Self> {
        let last = segments.pop()?;
        Some(ResourceIdentifier {
            subscription_id,
            resource_group,
            namespace: namespace.to_string(),
            parent_path: segments,
            type_key: last.key,
            name: last.name,
        })
    }

    /// The identifier of the enclosing resource, if any.
    pub fn parent(&self) -> Option<ResourceIdentifier> {
        let mut segments = self.parent_path.clone();
        let last = segments.pop()?;
        Some(ResourceIdentifier {
            subscription_id: self.subscription_id.clone(),
            resource_group: self.resource_group.clone(),
            namespace: self.namespace.clone(),
            parent_path: segments,
            type_key: last.key,
            name: last.name,
        })
    }

    /// Whether `self` is `other` or is nested (at any depth) below it.
    pub fn is_within(&self, other: &ResourceIdentifier) -> bool {
        let mut current = Some(self.clone());
        while let Some(id) = current {
            if &id == other {
                return true;
            }
            current = id.parent();
        }
        false
    }

    /// Provider namespace and segment keys, e.g.
    /// `Microsoft.ContainerService/managedClusters/agentPools`.
    /// Used to look up per-type settings such as API versions.
    pub fn type_path(&self) -> String {
        let mut s = self.namespace.clone();
        for segment in &self.parent_path {
            s.push('/');
            s.push_str(&segment.key);
        }
        s.push('/');
        s.push_str(&self.type_key);
        s
    }

    fn segments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parent_path
            .iter()
            .map(|s| (s.key.as_str(), s.name.as_str()))
            .chain(std::iter::once((self.type_key.as_str(), self.name.as_str())))
    }
}

impl Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}/{}/{}",
            SUBSCRIPTIONS,
            self.subscription_id,
            RESOURCE_GROUPS,
            self.resource_group,
            PROVIDERS,
            self.namespace
        )?;
        for (key, name) in self.segments() {
            write!(f, "/{}/{}", key, name)?;
        }
        Ok(())
    }
}

/// Parses an identifier of any shape. Use [`IdTemplate::parse`] when the
/// resource type is known.
impl FromStr for ResourceIdentifier {
    type Err = MalformedIdentifier;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts = split(raw)?;
        if parts.len() < 8 || parts.len() % 2 != 0 {
            return Err(MalformedIdentifier::new(
                raw,
                format!(
                    "expected an even number of at least 8 path segments, got {}",
                    parts.len()
                ),
            ));
        }
        let (subscription_id, resource_group, namespace) = prefix(raw, &parts)?;
        let segments = parts[6..]
            .chunks(2)
            .map(|pair| Segment {
                key: pair[0].to_string(),
                name: pair[1].to_string(),
            })
            .collect();
        ResourceIdentifier::from_segments(subscription_id, resource_group, namespace, segments)
            .ok_or_else(|| MalformedIdentifier::new(raw, "no resource segment"))
    }
}

impl PartialEq for ResourceIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.subscription_id == other.subscription_id
            && self.resource_group == other.resource_group
            && self.namespace.eq_ignore_ascii_case(&other.namespace)
            && self.parent_path == other.parent_path
            && self.type_key.eq_ignore_ascii_case(&other.type_key)
            && self.name == other.name
    }
}
impl Eq for ResourceIdentifier {}

impl Hash for ResourceIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.subscription_id.hash(state);
        self.resource_group.hash(state);
        self.namespace.to_ascii_lowercase().hash(state);
        for (key, name) in self.segments() {
            key.to_ascii_lowercase().hash(state);
            name.hash(state);
        }
    }
}

impl Serialize for ResourceIdentifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceIdentifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn split(raw: &str) -> Result<Vec<&str>, MalformedIdentifier> {
    let rest = raw
        .strip_prefix('/')
        .ok_or_else(|| MalformedIdentifier::new(raw, "must start with '/'"))?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(MalformedIdentifier::new(raw, "empty path segment"));
    }
    Ok(parts)
}

/// Checks the fixed `/subscriptions/{s}/resourceGroups/{g}/providers/{ns}` prefix.
fn prefix<'a>(
    raw: &str,
    parts: &[&'a str],
) -> Result<(String, String, &'a str), MalformedIdentifier> {
    for (index, literal) in [(0, SUBSCRIPTIONS), (2, RESOURCE_GROUPS), (4, PROVIDERS)] {
        if !parts[index].eq_ignore_ascii_case(literal) {
            return Err(MalformedIdentifier::new(
                raw,
                format!("expected segment key {}, got {}", literal, parts[index]),
            ));
        }
    }
    Ok((parts[1].to_string(), parts[3].to_string(), parts[5]))
}
