//! Jails and releases as seen by the lifecycle layer
//!
//! A resource is a named dataset on one of the configured sources together
//! with its stored property bag.

pub mod filter;
pub mod selector;

pub use filter::{FilterExpression, PropertyBag};
pub use selector::ResourceIdentifier;

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// What a dataset holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Jail,
    Release,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Jail => write!(f, "jail"),
            ResourceKind::Release => write!(f, "release"),
        }
    }
}

/// Which resources a destroy run selects from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Jail,
    Template,
    Release,
}

impl TargetKind {
    /// Dataset kind backing this target kind
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            TargetKind::Jail | TargetKind::Template => ResourceKind::Jail,
            TargetKind::Release => ResourceKind::Release,
        }
    }

    /// Filter added in front of the user's filters
    pub fn implicit_filter(&self) -> Option<&'static str> {
        match self {
            TargetKind::Jail => Some("template=no,-"),
            TargetKind::Template => Some("template=yes"),
            TargetKind::Release => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Jail => write!(f, "jails"),
            TargetKind::Template => write!(f, "templates"),
            TargetKind::Release => write!(f, "releases"),
        }
    }
}

/// A jail or release dataset
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub source: String,
    pub name: String,
    pub kind: ResourceKind,
    /// ZFS dataset name
    pub dataset: String,
    /// Where the dataset is mounted on the host
    pub mountpoint: PathBuf,
    /// Stored configuration properties
    pub properties: BTreeMap<String, String>,
}

impl Resource {
    /// `source/name`
    pub fn full_name(&self) -> String {
        ResourceIdentifier::qualified(&self.source, &self.name).to_string()
    }

    /// Name of the running jail in the kernel
    ///
    /// Leaf names repeat across sources, so the source is part of it. Neither
    /// `:` nor `*` can appear in a resource name, and the kernel reads `.` as a
    /// hierarchy separator, hence `source:name` with dots turned into `*`.
    pub fn jail_name(&self) -> String {
        format!("{}:{}", self.source, self.name).replace('.', "*")
    }

    /// Root filesystem of the jail or release
    pub fn root_path(&self) -> PathBuf {
        self.mountpoint.join("root")
    }

    pub fn fstab_path(&self) -> PathBuf {
        self.mountpoint.join("fstab")
    }

    pub fn config_path(&self) -> PathBuf {
        self.mountpoint.join("config.json")
    }

    /// Whether other jails may be cloned from this one
    pub fn is_template(&self) -> bool {
        self.kind == ResourceKind::Jail && self.property("template") == Some("yes")
    }

    /// Release this jail was created from, if known
    pub fn release(&self) -> Option<&str> {
        match self.kind {
            ResourceKind::Release => Some(&self.name),
            ResourceKind::Jail => self.property("release"),
        }
    }
}

impl PropertyBag for Resource {
    fn property(&self, key: &str) -> Option<&str> {
        match key {
            "name" => Some(&self.name),
            "source" => Some(&self.source),
            _ => self.properties.get(key).map(String::as_str),
        }
    }
}

/// Pick the single resource a selector addresses
///
/// An unqualified name that exists on several sources is ambiguous.
pub fn find_one(
    resources: Vec<Resource>,
    id: &ResourceIdentifier,
    kind: ResourceKind,
) -> Result<Resource> {
    let mut matched: Vec<Resource> = resources
        .into_iter()
        .filter(|r| r.kind == kind && id.matches(&r.source, &r.name))
        .collect();

    match matched.len() {
        0 => Err(Error::not_found(&kind.to_string(), id.to_string())),
        1 => Ok(matched.remove(0)),
        _ => {
            let sources: Vec<String> = matched.iter().map(Resource::full_name).collect();
            Err(Error::InvalidInput(format!(
                "'{}' is ambiguous, qualify it with a source: {}",
                id,
                sources.join(", ")
            )))
        }
    }
}

/// Parse `key=value` property arguments
pub fn parse_properties<S: AsRef<str>>(args: &[S]) -> Result<BTreeMap<String, String>> {
    let mut properties = BTreeMap::new();
    for arg in args {
        let arg = arg.as_ref();
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| Error::InvalidInput(format!("expected key=value, got '{}'", arg)))?;
        if key.is_empty() {
            return Err(Error::InvalidInput(format!("empty property name in '{}'", arg)));
        }
        properties.insert(key.to_string(), value.to_string());
    }
    Ok(properties)
}

#[cfg(test)]
pub(crate) fn test_jail(source: &str, name: &str, props: &[(&str, &str)]) -> Resource {
    Resource {
        source: source.to_string(),
        name: name.to_string(),
        kind: ResourceKind::Jail,
        dataset: format!("{}/moorage/jails/{}", source, name),
        mountpoint: PathBuf::from(format!("/{}/moorage/jails/{}", source, name)),
        properties: props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}
