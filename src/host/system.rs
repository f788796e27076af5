//! ZFS and jail(8) backed host
//!
//! Layout of every source dataset:
//! - `<dataset>/jails/<name>` with `config.json`, `fstab` and a `root` child
//! - `<dataset>/releases/<release>` with a `root` child holding the extracted
//!   distribution sets
//!
//! New jails are clones of a snapshot of their origin's root.

use crate::error::{Error, Result};
use crate::fstab::{self, Fstab, FstabLine};
use crate::host::{Backend, CommandOutput, NewJail, ReleaseStatus};
use crate::manifest::{MoorageConfig, SourceDef, ToolPaths};
use crate::resource::selector::is_valid_name;
use crate::resource::{Resource, ResourceKind};
use crate::supply::ReleaseMirror;
use crate::sys;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Release directories a basejail mounts read-only instead of owning
pub const BASEJAIL_DIRS: &[&str] = &[
    "bin",
    "boot",
    "lib",
    "libexec",
    "rescue",
    "sbin",
    "usr/bin",
    "usr/include",
    "usr/lib",
    "usr/lib32",
    "usr/libdata",
    "usr/libexec",
    "usr/sbin",
    "usr/share",
];

const EXPORT_SNAPSHOT: &str = "moorage-export";

/// The real host
pub struct SystemHost {
    sources: Vec<SourceDef>,
    tools: ToolPaths,
    mirror: ReleaseMirror,
}

impl SystemHost {
    pub fn new(config: &MoorageConfig) -> Result<Self> {
        let arch = sys::machine()?;
        Ok(Self {
            sources: config.sources.clone(),
            tools: config.tools.clone(),
            mirror: ReleaseMirror::new(&config.releases, &config.retry, arch),
        })
    }

    fn source(&self, name: &str) -> Result<&SourceDef> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::not_found("source", name))
    }

    fn zfs(&self, args: &[&str]) -> Result<String> {
        run_captured("zfs", Command::new("zfs").args(args))
    }

    fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let output = Command::new("zfs")
            .args(["list", "-H", "-o", "name", dataset])
            .stderr(Stdio::null())
            .output()
            .map_err(|e| Error::CommandFailed {
                command: "zfs list".into(),
                message: e.to_string(),
            })?;
        Ok(output.status.success())
    }

    /// Direct children of `parent` with their mountpoints
    fn children(&self, parent: &str) -> Result<Vec<(String, PathBuf)>> {
        if !self.dataset_exists(parent)? {
            return Ok(Vec::new());
        }
        let listing = self.zfs(&["list", "-H", "-o", "name,mountpoint", "-d", "1", parent])?;
        Ok(parse_children(&listing, parent))
    }

    fn resource(
        &self,
        source: &SourceDef,
        kind: ResourceKind,
        name: &str,
        mountpoint: PathBuf,
    ) -> Resource {
        let parent = match kind {
            ResourceKind::Jail => "jails",
            ResourceKind::Release => "releases",
        };
        let mut resource = Resource {
            source: source.name.clone(),
            name: name.to_string(),
            kind,
            dataset: format!("{}/{}/{}", source.dataset, parent, name),
            mountpoint,
            properties: BTreeMap::new(),
        };
        if kind == ResourceKind::Jail {
            resource.properties = read_properties(&resource.config_path());
        }
        resource
    }

    fn snapshot(&self, snapshot: &str) -> Result<()> {
        self.zfs(&["snapshot", snapshot]).map(|_| ())
    }

    /// Root dataset snapshot a new jail is cloned from
    fn origin_snapshot(&self, origin: &Resource, jail: &str) -> Result<String> {
        let snapshot = format!("{}/root@{}", origin.dataset, jail);
        self.snapshot(&snapshot)?;
        Ok(snapshot)
    }

    fn jail_tool(&self, args: &[String]) -> Result<()> {
        let status = Command::new(&self.tools.jail)
            .args(args)
            .status()
            .map_err(|e| Error::CommandFailed {
                command: self.tools.jail.display().to_string(),
                message: e.to_string(),
            })?;
        if !status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} {}", self.tools.jail.display(), args.join(" ")),
                message: format!("exited with {}", status),
            });
        }
        Ok(())
    }
}

impl Backend for SystemHost {
    fn sources(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }

    fn resources(&self, kind: ResourceKind) -> Result<Vec<Resource>> {
        let parent = match kind {
            ResourceKind::Jail => "jails",
            ResourceKind::Release => "releases",
        };

        let mut resources = Vec::new();
        for source in &self.sources {
            let container = format!("{}/{}", source.dataset, parent);
            for (name, mountpoint) in self.children(&container)? {
                if !is_valid_name(&name) {
                    tracing::debug!("ignoring dataset {}/{}", container, name);
                    continue;
                }
                resources.push(self.resource(source, kind, &name, mountpoint));
            }
        }
        Ok(resources)
    }

    fn release_status(&self, source: &str, release: &str) -> Result<ReleaseStatus> {
        let def = self.source(source)?;
        let dataset = format!("{}/releases/{}", def.dataset, release);

        if self.dataset_exists(&format!("{}/root", dataset))? {
            let mountpoint = def.mountpoint().join("releases").join(release);
            return Ok(ReleaseStatus::Fetched(self.resource(
                def,
                ResourceKind::Release,
                release,
                mountpoint,
            )));
        }

        if self.mirror.is_available(release)? {
            Ok(ReleaseStatus::Available)
        } else {
            Ok(ReleaseStatus::Unavailable)
        }
    }

    fn fetch_release(&self, source: &str, release: &str) -> Result<Resource> {
        let def = self.source(source)?;
        let dataset = format!("{}/releases/{}", def.dataset, release);
        self.zfs(&["create", "-p", "-o", "compression=lz4", &format!("{}/root", dataset)])?;

        let mountpoint = def.mountpoint().join("releases").join(release);
        self.mirror.fetch_into(release, &mountpoint.join("root"))?;
        tracing::info!("release {} fetched into {}", release, dataset);

        Ok(self.resource(def, ResourceKind::Release, release, mountpoint))
    }

    fn create_jail(&self, request: &NewJail, origin: &Resource) -> Result<Resource> {
        let def = self.source(&request.source)?;
        let dataset = format!("{}/jails/{}", def.dataset, request.name);
        if self.dataset_exists(&dataset)? {
            return Err(Error::operation(&request.name, format!("{} already exists", dataset)));
        }

        self.zfs(&["create", "-p", &dataset])?;
        let snapshot = self.origin_snapshot(origin, &request.name)?;
        self.zfs(&["clone", &snapshot, &format!("{}/root", dataset)])?;

        let mountpoint = def.mountpoint().join("jails").join(&request.name);
        let mut jail = Resource {
            source: def.name.clone(),
            name: request.name.clone(),
            kind: ResourceKind::Jail,
            dataset,
            mountpoint,
            properties: new_jail_properties(request, origin),
        };

        match origin.kind {
            ResourceKind::Jail if origin.fstab_path().exists() => {
                fs::copy(origin.fstab_path(), jail.fstab_path())?;
            }
            ResourceKind::Release if request.basejail => {
                let mut table = Fstab::open(jail.fstab_path())?;
                for dir in BASEJAIL_DIRS {
                    let line = FstabLine::new(origin.root_path().join(dir), jail.root_path().join(dir));
                    fstab::ensure_destination(&line.destination)?;
                    table.append(line)?;
                }
                table.save()?;
            }
            _ => {}
        }

        let basejail = request.basejail && origin.kind == ResourceKind::Release;
        jail.properties.insert("basejail".into(), yes_no(basejail));
        self.save_properties(&jail)?;
        Ok(jail)
    }

    fn start_jail(&self, jail: &Resource) -> Result<()> {
        tracing::info!("starting {}", jail.full_name());
        self.jail_tool(&jail_parameters(jail))
    }

    fn stop_jail(&self, jail: &Resource) -> Result<()> {
        tracing::info!("stopping {}", jail.full_name());
        self.jail_tool(&["-r".to_string(), jail.jail_name()])
    }

    fn destroy(&self, resource: &Resource, recursive: bool) -> Result<()> {
        // The snapshot a jail was cloned from outlives the clone
        let origin = if resource.kind == ResourceKind::Jail {
            self.zfs(&["get", "-H", "-o", "value", "origin", &format!("{}/root", resource.dataset)])
                .inspect_err(|e| {
                    tracing::debug!("no origin for {}: {}", resource.full_name(), e);
                })
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| s.contains('@'))
        } else {
            None
        };

        let mut args = vec!["destroy", "-r"];
        if recursive {
            args.push("-R");
        }
        args.push(resource.dataset.as_str());
        self.zfs(&args)?;

        if let Some(snapshot) = origin
            && let Err(e) = self.zfs(&["destroy", &snapshot])
        {
            tracing::warn!("could not remove origin snapshot {}: {}", snapshot, e);
        }
        Ok(())
    }

    fn send_root(&self, jail: &Resource, dest: &Path) -> Result<()> {
        let snapshot = format!("{}/root@{}", jail.dataset, EXPORT_SNAPSHOT);
        self.snapshot(&snapshot)?;

        let sent = File::create(dest).map_err(Error::from).and_then(|file| {
            let status = Command::new("zfs")
                .args(["send", &snapshot])
                .stdout(Stdio::from(file))
                .status()
                .map_err(|e| Error::CommandFailed {
                    command: "zfs send".into(),
                    message: e.to_string(),
                })?;
            if status.success() {
                Ok(())
            } else {
                Err(Error::CommandFailed {
                    command: format!("zfs send {}", snapshot),
                    message: format!("exited with {}", status),
                })
            }
        });

        if let Err(e) = self.zfs(&["destroy", &snapshot]) {
            tracing::warn!("could not remove export snapshot {}: {}", snapshot, e);
        }
        sent
    }

    fn exec(&self, jail: &Resource, command: &[String]) -> Result<CommandOutput> {
        tracing::debug!("jexec {} {}", jail.jail_name(), command.join(" "));
        let output = Command::new(&self.tools.jexec)
            .arg(jail.jail_name())
            .args(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::CommandFailed {
                command: self.tools.jexec.display().to_string(),
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn save_properties(&self, jail: &Resource) -> Result<()> {
        let json = serde_json::to_vec_pretty(&jail.properties)?;
        fstab::write_atomic(&jail.config_path(), &json)
    }
}

/// Run a command and return its stdout, failing on a non-zero exit
fn run_captured(name: &str, command: &mut Command) -> Result<String> {
    let output = command.output().map_err(|e| Error::CommandFailed {
        command: name.to_string(),
        message: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: name.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `zfs list -H -o name,mountpoint -d 1 <parent>` output
fn parse_children(listing: &str, parent: &str) -> Vec<(String, PathBuf)> {
    let prefix = format!("{}/", parent);
    listing
        .lines()
        .filter_map(|line| {
            let (dataset, mountpoint) = line.split_once('\t')?;
            let name = dataset.strip_prefix(&prefix)?;
            if name.contains('/') {
                return None;
            }
            Some((name.to_string(), PathBuf::from(mountpoint.trim())))
        })
        .collect()
}

fn read_properties(path: &Path) -> BTreeMap<String, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("cannot read {}: {}", path.display(), e);
            return BTreeMap::new();
        }
    };
    serde_json::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!("ignoring malformed {}: {}", path.display(), e);
        BTreeMap::new()
    })
}

fn yes_no(flag: bool) -> String {
    let value = if flag { "yes" } else { "no" };
    value.to_string()
}

/// Stored properties of a freshly created jail
fn new_jail_properties(request: &NewJail, origin: &Resource) -> BTreeMap<String, String> {
    let mut properties = match origin.kind {
        ResourceKind::Jail => {
            let mut inherited = origin.properties.clone();
            inherited.remove("template");
            inherited.insert("origin".into(), origin.full_name());
            inherited
        }
        ResourceKind::Release => BTreeMap::new(),
    };
    if let Some(release) = origin.release() {
        properties.insert("release".into(), release.to_string());
    }
    properties.extend(request.properties.clone());
    properties
}

/// Arguments for `jail -c`
fn jail_parameters(jail: &Resource) -> Vec<String> {
    let hostname = jail
        .properties
        .get("host_hostname")
        .cloned()
        .unwrap_or_else(|| jail.name.clone());

    let mut params = vec![
        "-c".to_string(),
        format!("name={}", jail.jail_name()),
        format!("path={}", jail.root_path().display()),
        format!("host.hostname={}", hostname),
        "persist".to_string(),
        "mount.devfs".to_string(),
        "exec.start=/bin/sh /etc/rc".to_string(),
        "exec.stop=/bin/sh /etc/rc.shutdown".to_string(),
    ];
    if jail.fstab_path().exists() {
        params.push(format!("mount.fstab={}", jail.fstab_path().display()));
    }
    for (key, value) in &jail.properties {
        if let Some(param) = key.strip_prefix("jail.") {
            params.push(format!("{}={}", param, value));
        }
    }
    params
}
