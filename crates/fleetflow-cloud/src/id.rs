//! Hierarchical resource identifier parsing
//!
//! Resource identifiers are slash-delimited `key/value` paths of the form
//!
//! ```text
//! /subscriptions/{id}/resourceGroups/{rg}/providers/{ns}/{type}/{name}[/{childType}/{childName}]...
//! ```
//!
//! Keys are matched case-insensitively; values keep their original casing.

use crate::error::{CloudError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

const SUBSCRIPTIONS: &str = "subscriptions";
const RESOURCE_GROUPS: &str = "resourceGroups";
const PROVIDERS: &str = "providers";

/// One typed `{type}/{name}` step below the resource group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    /// Provider namespace in effect for this step (e.g. `Microsoft.Network`)
    pub namespace: Option<String>,
    /// Pluralized type name (e.g. `loadBalancers`)
    pub type_name: String,
    /// Instance name
    pub name: String,
}

/// Parsed resource identifier
///
/// Immutable once built; use [`ResourceIdentifier::child`] and
/// [`ResourceIdentifier::parent`] to derive related identifiers.
#[derive(Debug, Clone)]
pub struct ResourceIdentifier {
    subscription_id: String,
    resource_group: String,
    segments: Vec<Segment>,
    lookup: HashMap<String, String>,
}

impl ResourceIdentifier {
    /// Parse a resource identifier path.
    pub fn parse(path: &str) -> Result<Self> {
        let malformed = |reason: &str| CloudError::MalformedIdentifier {
            id: path.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(malformed("identifier is empty"));
        }

        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.len() % 2 != 0 {
            return Err(malformed("expected an even number of key/value segments"));
        }
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(malformed("identifier contains an empty segment"));
        }

        let mut subscription_id = None;
        let mut resource_group = None;
        let mut namespace: Option<String> = None;
        let mut segments = Vec::new();
        let mut lookup = HashMap::new();

        for pair in parts.chunks(2) {
            let (key, value) = (pair[0], pair[1]);
            lookup
                .entry(key.to_ascii_lowercase())
                .or_insert_with(|| value.to_string());

            if key.eq_ignore_ascii_case(SUBSCRIPTIONS) {
                if !segments.is_empty() || resource_group.is_some() {
                    return Err(malformed("subscriptions segment out of order"));
                }
                subscription_id = Some(value.to_string());
            } else if key.eq_ignore_ascii_case(RESOURCE_GROUPS) {
                if !segments.is_empty() {
                    return Err(malformed("resourceGroups segment out of order"));
                }
                resource_group = Some(value.to_string());
            } else if key.eq_ignore_ascii_case(PROVIDERS) {
                namespace = Some(value.to_string());
            } else {
                segments.push(Segment {
                    namespace: namespace.clone(),
                    type_name: key.to_string(),
                    name: value.to_string(),
                });
            }
        }

        let subscription_id =
            subscription_id.ok_or_else(|| malformed("missing subscriptions segment"))?;
        let resource_group =
            resource_group.ok_or_else(|| CloudError::MissingResourceGroup(path.to_string()))?;

        Ok(Self {
            subscription_id,
            resource_group,
            segments,
            lookup,
        })
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    /// Provider namespace of the top-level resource, if any
    pub fn provider(&self) -> Option<&str> {
        self.segments.first().and_then(|s| s.namespace.as_deref())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Type of the innermost resource (`resourceGroups` for a bare group id)
    pub fn resource_type(&self) -> &str {
        self.segments
            .last()
            .map(|s| s.type_name.as_str())
            .unwrap_or(RESOURCE_GROUPS)
    }

    /// Name of the innermost resource
    pub fn name(&self) -> &str {
        self.segments
            .last()
            .map(|s| s.name.as_str())
            .unwrap_or(&self.resource_group)
    }

    /// Look up a segment value by key, ignoring case. The first occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lookup
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Identifier of the enclosing resource, or `None` for a resource group.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self::from_parts(
            self.subscription_id.clone(),
            self.resource_group.clone(),
            segments,
        ))
    }

    /// Identifier of a nested resource under this one, in the same namespace.
    pub fn child(&self, type_name: impl Into<String>, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment {
            namespace: self.segments.last().and_then(|s| s.namespace.clone()),
            type_name: type_name.into(),
            name: name.into(),
        });
        Self::from_parts(
            self.subscription_id.clone(),
            self.resource_group.clone(),
            segments,
        )
    }

    fn from_parts(subscription_id: String, resource_group: String, segments: Vec<Segment>) -> Self {
        let mut lookup = HashMap::new();
        lookup.insert(SUBSCRIPTIONS.to_string(), subscription_id.clone());
        lookup.insert(RESOURCE_GROUPS.to_ascii_lowercase(), resource_group.clone());
        for segment in &segments {
            if let Some(ns) = &segment.namespace {
                lookup
                    .entry(PROVIDERS.to_string())
                    .or_insert_with(|| ns.clone());
            }
            lookup
                .entry(segment.type_name.to_ascii_lowercase())
                .or_insert_with(|| segment.name.clone());
        }
        Self {
            subscription_id,
            resource_group,
            segments,
            lookup,
        }
    }
}

impl PartialEq for ResourceIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.subscription_id == other.subscription_id
            && self.resource_group == other.resource_group
            && self.segments == other.segments
    }
}

impl Eq for ResourceIdentifier {}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            SUBSCRIPTIONS, self.subscription_id, RESOURCE_GROUPS, self.resource_group
        )?;
        let mut current_ns: Option<&str> = None;
        for segment in &self.segments {
            let ns = segment.namespace.as_deref();
            if ns.is_some() && ns != current_ns {
                write!(f, "/{}/{}", PROVIDERS, ns.unwrap_or_default())?;
                current_ns = ns;
            }
            write!(f, "/{}/{}", segment.type_name, segment.name)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceIdentifier {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ResourceIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
