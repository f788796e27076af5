//! Release mirror access
//!
//! Provides:
//! - Availability checks against the mirror's MANIFEST
//! - SHA256-verified archive downloads
//! - Extraction of `.txz` distribution sets into a release root
//! - Retry with exponential backoff for network operations

use crate::error::{Error, Result};
use crate::manifest::{ReleaseConfig, RetryConfig};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tar::Archive;
use tempfile::NamedTempFile;
use xz2::read::XzDecoder;

fn backoff_from_config(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(config.base_delay_ms)
        .max_delay_ms(config.max_delay_ms)
        .multiplier(config.multiplier)
        .max_attempts(config.max_attempts)
        .jitter_factor(config.jitter_factor)
}

/// Run `op` until it succeeds or the backoff gives up
fn with_retry<T>(config: &RetryConfig, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let backoff = backoff_from_config(config);
    let mut rng = rng();
    let mut attempt: u8 = 0;

    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => match backoff.delay(attempt, &mut rng) {
                Some(delay_ms) => {
                    tracing::warn!(
                        "{} attempt {} failed ({}), retrying in {}ms",
                        what,
                        attempt,
                        e,
                        delay_ms
                    );
                    thread::sleep(Duration::from_millis(delay_ms));
                }
                None => return Err(e),
            },
        }
    }
}

/// Parse a MANIFEST into archive name -> sha256
///
/// Format: `base.txz<TAB>sha256<TAB>entries<TAB>name<TAB>...`
pub fn parse_manifest(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let archive = parts.next()?.trim_end_matches(".txz");
            let sha256 = parts.next()?;
            Some((archive.to_string(), sha256.to_string()))
        })
        .collect()
}

/// Copy `reader` into `writer`, returning the hex sha256 of the bytes
pub fn copy_hashed(reader: &mut impl Read, writer: &mut impl Write) -> Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    Ok((total, hex::encode(hasher.finalize())))
}

/// Unpack a tar.xz stream into `dest`, keeping modes and owners
pub fn extract_txz(reader: impl Read, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(XzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive
        .unpack(dest)
        .map_err(|e| Error::ExtractionFailed(format!("{}: {}", dest.display(), e)))
}

/// A FreeBSD release mirror for one architecture
pub struct ReleaseMirror {
    base_url: String,
    arch: String,
    archives: Vec<String>,
    retry: RetryConfig,
}

impl ReleaseMirror {
    pub fn new(config: &ReleaseConfig, retry: &RetryConfig, arch: impl Into<String>) -> Self {
        Self {
            base_url: config.mirror_url.trim_end_matches('/').to_string(),
            arch: arch.into(),
            archives: config.archives.clone(),
            retry: retry.clone(),
        }
    }

    fn release_url(&self, release: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.arch, release)
    }

    pub fn manifest_url(&self, release: &str) -> String {
        format!("{}/MANIFEST", self.release_url(release))
    }

    pub fn archive_url(&self, release: &str, archive: &str) -> String {
        format!("{}/{}.txz", self.release_url(release), archive)
    }

    /// Whether the mirror publishes `release`
    pub fn is_available(&self, release: &str) -> Result<bool> {
        let url = self.manifest_url(release);
        with_retry(&self.retry, "availability check", || match ureq::head(&url).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::StatusCode(404)) => Ok(false),
            Err(e) => Err(Error::DownloadFailed(format!("{}: {}", url, e))),
        })
    }

    fn fetch_manifest(&self, release: &str) -> Result<HashMap<String, String>> {
        let url = self.manifest_url(release);
        let text = with_retry(&self.retry, "MANIFEST fetch", || {
            ureq::get(&url)
                .call()
                .map_err(|e| Error::DownloadFailed(format!("{}: {}", url, e)))?
                .into_body()
                .read_to_string()
                .map_err(|e| Error::DownloadFailed(format!("{}: {}", url, e)))
        })?;
        Ok(parse_manifest(&text))
    }

    /// Download every configured archive of `release` and extract it into `root`
    pub fn fetch_into(&self, release: &str, root: &Path) -> Result<()> {
        let checksums = self.fetch_manifest(release)?;
        fs::create_dir_all(root)?;
        let staging = root.parent().unwrap_or(root);

        for archive in &self.archives {
            let expected = checksums.get(archive).ok_or_else(|| {
                Error::DownloadFailed(format!("{} is not listed in the {} MANIFEST", archive, release))
            })?;
            let url = self.archive_url(release, archive);

            with_retry(&self.retry, &format!("{}.txz", archive), || {
                let mut file = NamedTempFile::new_in(staging)?;
                tracing::info!("downloading {}", url);
                let response = ureq::get(&url)
                    .call()
                    .map_err(|e| Error::DownloadFailed(format!("{}: {}", url, e)))?;
                let mut body = response.into_body().into_reader();
                let (size, actual) = copy_hashed(&mut body, file.as_file_mut())?;

                if &actual != expected {
                    return Err(Error::ChecksumMismatch {
                        file: format!("{}.txz", archive),
                        expected: expected.clone(),
                        actual,
                    });
                }
                tracing::info!("{}.txz: {} bytes, checksum ok", archive, size);

                extract_txz(BufReader::new(file.reopen()?), root)
            })?;
        }

        Ok(())
    }
}
