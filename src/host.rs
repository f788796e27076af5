//! Storage and process backend
//!
//! Lifecycle operations talk to the host only through `Backend`, so their
//! batch policies can be exercised against an in-memory fake.

pub mod system;

use crate::error::Result;
use crate::resource::{Resource, ResourceKind};
use std::collections::BTreeMap;
use std::path::Path;

pub use system::SystemHost;

/// Local state of a release
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseStatus {
    /// Extracted locally and ready to clone
    Fetched(Resource),
    /// Published on the mirror but not downloaded
    Available,
    /// Not known locally or remotely
    Unavailable,
}

/// Everything needed to create one jail
#[derive(Debug, Clone, PartialEq)]
pub struct NewJail {
    pub source: String,
    pub name: String,
    pub properties: BTreeMap<String, String>,
    pub basejail: bool,
}

/// Result of a command run inside a jail
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Host services the lifecycle operations drive
pub trait Backend {
    /// Configured source names, primary first
    fn sources(&self) -> Vec<String>;

    /// All resources of a kind across every source
    fn resources(&self, kind: ResourceKind) -> Result<Vec<Resource>>;

    fn release_status(&self, source: &str, release: &str) -> Result<ReleaseStatus>;

    /// Download and extract a release onto a source
    fn fetch_release(&self, source: &str, release: &str) -> Result<Resource>;

    /// Create a jail from a release or template
    fn create_jail(&self, request: &NewJail, origin: &Resource) -> Result<Resource>;

    fn start_jail(&self, jail: &Resource) -> Result<()>;

    fn stop_jail(&self, jail: &Resource) -> Result<()>;

    /// Remove a resource's dataset; `recursive` also removes dependent clones
    fn destroy(&self, resource: &Resource, recursive: bool) -> Result<()>;

    /// Write the jail's root filesystem as a standalone send stream
    fn send_root(&self, jail: &Resource, dest: &Path) -> Result<()>;

    /// Run a command inside a running jail, capturing its output
    fn exec(&self, jail: &Resource, command: &[String]) -> Result<CommandOutput>;

    /// Persist a jail's property bag
    fn save_properties(&self, jail: &Resource) -> Result<()>;
}
