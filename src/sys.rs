//! Host release detection
//!
//! `create` defaults to the release the host runs. The kernel reports it with
//! a patch suffix (`14.2-RELEASE-p3`) that release mirrors never carry, so the
//! suffix is dropped when naming the release to fetch.

use crate::error::{Error, Result};
use std::ffi::CStr;
use std::fmt;

/// FreeBSD branch kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch {
    Current,
    Stable,
    Release,
    Beta(u8),
    Rc(u8),
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Current => write!(f, "CURRENT"),
            Branch::Stable => write!(f, "STABLE"),
            Branch::Release => write!(f, "RELEASE"),
            Branch::Beta(n) => write!(f, "BETA{}", n),
            Branch::Rc(n) => write!(f, "RC{}", n),
        }
    }
}

/// The release a host (or a release dataset) is on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRelease {
    pub major: u8,
    pub minor: u8,
    pub branch: Branch,
    /// Patch level from a `-pN` suffix
    pub patch: Option<u8>,
}

impl HostRelease {
    /// Read the running kernel's release through `uname(2)`
    pub fn detect() -> Result<Self> {
        let mut utsname: libc::utsname = unsafe { std::mem::zeroed() };

        let rc = unsafe { libc::uname(&mut utsname) };
        if rc != 0 {
            return Err(Error::CommandFailed {
                command: "uname(2)".to_string(),
                message: std::io::Error::last_os_error().to_string(),
            });
        }

        let release = unsafe { CStr::from_ptr(utsname.release.as_ptr()) };
        let release = release
            .to_str()
            .map_err(|e| Error::InvalidVersion(format!("uname release is not UTF-8: {}", e)))?;

        Self::parse(release)
    }

    /// Parse strings like `14.2-RELEASE`, `14.2-RELEASE-p3` or `15.0-RC2`
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('-');
        let version = parts.next().unwrap_or_default();
        let branch = parts
            .next()
            .ok_or_else(|| Error::InvalidVersion(s.to_string()))?;

        let (major, minor) = version
            .split_once('.')
            .ok_or_else(|| Error::InvalidVersion(s.to_string()))?;
        let major = major
            .parse::<u8>()
            .map_err(|_| Error::InvalidVersion(format!("bad major version in {}", s)))?;
        let minor = minor
            .parse::<u8>()
            .map_err(|_| Error::InvalidVersion(format!("bad minor version in {}", s)))?;

        let numbered = |prefix: &str| {
            branch
                .strip_prefix(prefix)
                .and_then(|n| n.parse::<u8>().ok())
                .unwrap_or(1)
        };

        let branch = match branch {
            "CURRENT" => Branch::Current,
            "STABLE" => Branch::Stable,
            "RELEASE" => Branch::Release,
            b if b.starts_with("BETA") => Branch::Beta(numbered("BETA")),
            b if b.starts_with("RC") => Branch::Rc(numbered("RC")),
            other => {
                return Err(Error::InvalidVersion(format!(
                    "unknown branch '{}' in {}",
                    other, s
                )));
            }
        };

        let patch = parts
            .next()
            .and_then(|p| p.strip_prefix('p'))
            .and_then(|n| n.parse::<u8>().ok());

        Ok(Self {
            major,
            minor,
            branch,
            patch,
        })
    }

    /// Release name as published on the mirrors, without the patch level
    pub fn release_name(&self) -> String {
        format!("{}.{}-{}", self.major, self.minor, self.branch)
    }
}

impl fmt::Display for HostRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.release_name())?;
        if let Some(patch) = self.patch {
            write!(f, "-p{}", patch)?;
        }
        Ok(())
    }
}

/// Hardware platform used in mirror paths (`amd64`, `arm64`)
pub fn machine() -> Result<String> {
    let mut utsname: libc::utsname = unsafe { std::mem::zeroed() };

    let rc = unsafe { libc::uname(&mut utsname) };
    if rc != 0 {
        return Err(Error::CommandFailed {
            command: "uname(2)".to_string(),
            message: std::io::Error::last_os_error().to_string(),
        });
    }

    let machine = unsafe { CStr::from_ptr(utsname.machine.as_ptr()) };
    match machine.to_str() {
        Ok("x86_64") => Ok("amd64".to_string()),
        Ok("aarch64") => Ok("arm64".to_string()),
        Ok(m) if !m.is_empty() => Ok(m.to_string()),
        _ => Err(Error::UnsupportedArch(machine.to_string_lossy().into_owned())),
    }
}
