//! Export containers for jails
//!
//! Provides:
//! - tar.zst archives carrying a JSON metadata header
//! - Plain directory exports with the same layout
//!
//! Both formats hold `config.json`, `fstab` and either the `root/` tree or a
//! standalone `root.zfs` send stream.

use crate::error::{Error, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tar::Builder;
use tempfile::NamedTempFile;

/// Name of the metadata entry, always written first
pub const METADATA_FILE: &str = ".moorage-export.json";

const ZSTD_LEVEL: i32 = 3;

/// On-disk shape of an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    /// Single zstd-compressed tar file
    Archive,
    /// Plain directory tree
    Directory,
}

impl ExportFormat {
    /// File name used when exporting into an existing directory
    pub fn file_name(&self, jail: &str) -> String {
        match self {
            ExportFormat::Archive => format!("{}.tar.zst", jail),
            ExportFormat::Directory => jail.to_string(),
        }
    }
}

/// Metadata stored alongside the exported files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    /// Exported jail name
    pub name: String,
    /// Source the jail lived on
    pub source: String,
    /// Moorage version that created the export
    pub version: String,
    /// Seconds since the epoch
    pub timestamp: String,
    /// Root filesystem is a ZFS send stream
    pub standalone: bool,
    pub release: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ExportMetadata {
    pub fn new(
        name: &str,
        source: &str,
        standalone: bool,
        properties: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: epoch_timestamp(),
            standalone,
            release: properties.get("release").cloned(),
            properties: properties.clone(),
        }
    }
}

/// Destination being filled by an export
pub enum ExportWriter {
    Archive {
        path: PathBuf,
        builder: Builder<zstd::stream::Encoder<'static, File>>,
    },
    Directory {
        path: PathBuf,
    },
}

impl ExportWriter {
    /// Create the destination; an existing path is never overwritten
    pub fn create(path: &Path, format: ExportFormat) -> Result<Self> {
        match format {
            ExportFormat::Archive => {
                let file = File::create_new(path).map_err(|e| {
                    Error::ExportFailed(format!("cannot create {}: {}", path.display(), e))
                })?;
                let encoder = zstd::stream::Encoder::new(file, ZSTD_LEVEL)
                    .map_err(|e| Error::ExportFailed(format!("failed to create compressor: {}", e)))?;
                let mut builder = Builder::new(encoder);
                // Jail roots are full of absolute symlinks that must stay links
                builder.follow_symlinks(false);
                Ok(ExportWriter::Archive {
                    path: path.to_path_buf(),
                    builder,
                })
            }
            ExportFormat::Directory => {
                fs::create_dir(path).map_err(|e| {
                    Error::ExportFailed(format!("cannot create {}: {}", path.display(), e))
                })?;
                Ok(ExportWriter::Directory {
                    path: path.to_path_buf(),
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ExportWriter::Archive { path, .. } | ExportWriter::Directory { path } => path,
        }
    }

    /// Store `data` as the file `name`
    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        match self {
            ExportWriter::Archive { builder, .. } => {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_mtime(epoch_seconds());
                header.set_cksum();
                builder
                    .append_data(&mut header, name, data)
                    .map_err(|e| Error::ExportFailed(format!("failed to add {}: {}", name, e)))
            }
            ExportWriter::Directory { path } => {
                fs::write(path.join(name), data)?;
                Ok(())
            }
        }
    }

    /// Copy the host file `src` in as `name`
    pub fn add_file(&mut self, name: &str, src: &Path) -> Result<()> {
        match self {
            ExportWriter::Archive { builder, .. } => builder
                .append_path_with_name(src, name)
                .map_err(|e| Error::ExportFailed(format!("failed to add {}: {}", name, e))),
            ExportWriter::Directory { path } => {
                fs::copy(src, path.join(name))?;
                Ok(())
            }
        }
    }

    /// Copy the directory tree `src` in as `name`
    pub fn add_tree(&mut self, name: &str, src: &Path) -> Result<()> {
        match self {
            ExportWriter::Archive { builder, .. } => builder
                .append_dir_all(name, src)
                .map_err(|e| Error::ExportFailed(format!("failed to add {}: {}", name, e))),
            ExportWriter::Directory { path } => copy_tree(src, &path.join(name)),
        }
    }

    /// Add a file produced by `produce`, which is handed the path to write
    pub fn add_generated(
        &mut self,
        name: &str,
        produce: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<()> {
        match self {
            ExportWriter::Archive { path, .. } => {
                let staging = path.parent().unwrap_or(Path::new("."));
                let temp = NamedTempFile::new_in(staging)?;
                produce(temp.path())?;
                let temp_path = temp.path().to_path_buf();
                self.add_file(name, &temp_path)
            }
            ExportWriter::Directory { path } => produce(&path.join(name)),
        }
    }

    /// Flush and close the destination
    pub fn finish(self) -> Result<PathBuf> {
        match self {
            ExportWriter::Archive { path, builder } => {
                let encoder = builder
                    .into_inner()
                    .map_err(|e| Error::ExportFailed(format!("failed to finalize archive: {}", e)))?;
                let file = encoder
                    .finish()
                    .map_err(|e| Error::ExportFailed(format!("failed to finish compression: {}", e)))?;
                file.sync_all()?;
                Ok(path)
            }
            ExportWriter::Directory { path } => Ok(path),
        }
    }
}

/// Read export metadata without unpacking the export
#[cfg(test)]
pub fn read_metadata(path: &Path) -> Result<ExportMetadata> {
    use std::io::Read;
    use tar::Archive;

    if path.is_dir() {
        let content = fs::read_to_string(path.join(METADATA_FILE))
            .map_err(|e| Error::ExportFailed(format!("failed to read metadata: {}", e)))?;
        return Ok(serde_json::from_str(&content)?);
    }

    let file = File::open(path)
        .map_err(|e| Error::ExportFailed(format!("failed to open archive: {}", e)))?;
    let decoder = zstd::stream::Decoder::new(file)
        .map_err(|e| Error::ExportFailed(format!("failed to decompress: {}", e)))?;
    let mut archive = Archive::new(decoder);

    for entry in archive
        .entries()
        .map_err(|e| Error::ExportFailed(format!("failed to read archive entries: {}", e)))?
    {
        let mut entry = entry
            .map_err(|e| Error::ExportFailed(format!("failed to read archive entry: {}", e)))?;
        let is_metadata = entry
            .path()
            .map_err(|e| Error::ExportFailed(format!("failed to read entry path: {}", e)))?
            .as_os_str()
            == METADATA_FILE;

        if is_metadata {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            return Ok(serde_json::from_str(&content)?);
        }
    }

    Err(Error::ExportFailed(format!(
        "{} has no metadata",
        path.display()
    )))
}

/// Recursive copy keeping symlinks as links and file modes
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)?;
        } else {
            tracing::warn!("skipping special file {}", from.display());
        }
    }

    fs::set_permissions(dst, fs::metadata(src)?.permissions())?;
    Ok(())
}

fn epoch_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn epoch_timestamp() -> String {
    epoch_seconds().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tar::Archive;

    fn jail_tree(dir: &Path) -> PathBuf {
        let root = dir.join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/rc.conf"), "sshd_enable=\"YES\"\n").unwrap();
        symlink("/etc/rc.conf", root.join("rc.link")).unwrap();
        root
    }

    fn metadata() -> ExportMetadata {
        let mut props = BTreeMap::new();
        props.insert("release".to_string(), "14.2-RELEASE".to_string());
        ExportMetadata::new("web", "zroot", false, &props)
    }

    #[test]
    fn test_metadata_serialization() {
        let meta = metadata();
        assert_eq!(meta.release.as_deref(), Some("14.2-RELEASE"));

        let json = serde_json::to_string(&meta).unwrap();
        let parsed: ExportMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_archive_export() {
        let dir = tempfile::tempdir().unwrap();
        let root = jail_tree(dir.path());
        let dest = dir.path().join("web.tar.zst");

        let mut writer = ExportWriter::create(&dest, ExportFormat::Archive).unwrap();
        let meta = metadata();
        writer
            .add_bytes(METADATA_FILE, &serde_json::to_vec(&meta).unwrap())
            .unwrap();
        writer.add_bytes("fstab", b"").unwrap();
        writer.add_tree("root", &root).unwrap();
        assert_eq!(writer.finish().unwrap(), dest);

        assert_eq!(read_metadata(&dest).unwrap(), meta);

        let mut archive = Archive::new(zstd::stream::Decoder::new(File::open(&dest).unwrap()).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names[0], METADATA_FILE);
        assert!(names.iter().any(|n| n == "root/etc/rc.conf"));
        assert!(names.iter().any(|n| n == "root/rc.link"));
    }

    #[test]
    fn test_archive_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("web.tar.zst");
        fs::write(&dest, "keep me").unwrap();

        assert!(ExportWriter::create(&dest, ExportFormat::Archive).is_err());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "keep me");
    }

    #[test]
    fn test_directory_export() {
        let dir = tempfile::tempdir().unwrap();
        let root = jail_tree(dir.path());
        let dest = dir.path().join("web-export");

        let mut writer = ExportWriter::create(&dest, ExportFormat::Directory).unwrap();
        writer
            .add_bytes(METADATA_FILE, &serde_json::to_vec(&metadata()).unwrap())
            .unwrap();
        writer.add_tree("root", &root).unwrap();
        writer
            .add_generated("root.zfs", |path| {
                fs::write(path, "stream")?;
                Ok(())
            })
            .unwrap();
        writer.finish().unwrap();

        assert_eq!(read_metadata(&dest).unwrap().name, "web");
        assert_eq!(
            fs::read_to_string(dest.join("root/etc/rc.conf")).unwrap(),
            "sshd_enable=\"YES\"\n"
        );
        assert_eq!(
            fs::read_link(dest.join("root/rc.link")).unwrap(),
            PathBuf::from("/etc/rc.conf")
        );
        assert_eq!(fs::read_to_string(dest.join("root.zfs")).unwrap(), "stream");
    }

    #[test]
    fn test_generated_entry_in_archive() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("web.tar.zst");

        let mut writer = ExportWriter::create(&dest, ExportFormat::Archive).unwrap();
        writer
            .add_generated("root.zfs", |path| {
                fs::write(path, "zfs stream")?;
                Ok(())
            })
            .unwrap();
        writer.finish().unwrap();

        let mut archive = Archive::new(zstd::stream::Decoder::new(File::open(&dest).unwrap()).unwrap());
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "zfs stream");
        // staging file is gone
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
