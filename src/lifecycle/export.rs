//! Export one jail to an archive or a directory
//!
//! Exports are never recursive: snapshots and dependent clones stay behind
//! because imports cannot restore them.

use crate::error::{Error, Result};
use crate::export::{ExportFormat, ExportMetadata, ExportWriter, METADATA_FILE};
use crate::host::Backend;
use crate::lifecycle::{EventKind, LifecycleEvent, OperationOutcome, Step, Verdict};
use crate::resource::{self, Resource, ResourceIdentifier, ResourceKind};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub jail: ResourceIdentifier,
    /// File or directory to create, or an existing directory to export into
    pub destination: PathBuf,
    /// Ship the root filesystem as a ZFS send stream
    pub standalone: bool,
    pub format: ExportFormat,
}

enum Phase {
    Start,
    Fstab,
    Root,
    Write,
    Done,
    Finished,
}

/// Iterator writing one export
pub struct ExportOperation<'a> {
    backend: &'a dyn Backend,
    request: ExportRequest,
    phase: Phase,
    jail: Option<Resource>,
    writer: Option<ExportWriter>,
    outcome: OperationOutcome,
}

impl<'a> ExportOperation<'a> {
    pub fn new(backend: &'a dyn Backend, request: ExportRequest) -> Self {
        Self {
            backend,
            request,
            phase: Phase::Start,
            jail: None,
            writer: None,
            outcome: OperationOutcome::default(),
        }
    }

    fn finish(&mut self, verdict: Verdict) -> Option<Step> {
        self.phase = Phase::Finished;
        Some(Step::Finished(verdict))
    }

    /// Where the export lands; an existing file is never replaced
    fn destination(&self, jail: &Resource) -> Result<PathBuf> {
        let requested = &self.request.destination;
        if requested.is_file() {
            return Err(Error::InvalidInput(format!(
                "{} already exists",
                requested.display()
            )));
        }

        let dest = if requested.is_dir() {
            requested.join(self.request.format.file_name(&jail.name))
        } else {
            requested.clone()
        };
        if fs::symlink_metadata(&dest).is_ok() {
            return Err(Error::InvalidInput(format!(
                "{} already exists",
                dest.display()
            )));
        }
        Ok(dest)
    }

    fn run_step(
        &mut self,
        kind: EventKind,
        next: Phase,
        step: impl FnOnce(&mut ExportWriter, &Resource) -> Result<()>,
    ) -> Option<Step> {
        let (Some(jail), Some(writer)) = (self.jail.as_ref(), self.writer.as_mut()) else {
            return self.finish(Verdict::Rejected(Error::InvalidInput(
                "export was not started".into(),
            )));
        };
        let target = jail.full_name();

        match step(writer, jail) {
            Ok(()) => {
                self.phase = next;
                Some(Step::Event(LifecycleEvent::done(kind, target)))
            }
            Err(e) => {
                let event = LifecycleEvent::failed(kind, &target, &e);
                self.outcome.fail(target, e);
                self.phase = Phase::Done;
                if let Some(writer) = self.writer.take() {
                    let path = writer.path().to_path_buf();
                    drop(writer);
                    remove_partial(&path);
                }
                Some(Step::Event(event))
            }
        }
    }

    fn start(&mut self) -> Option<Step> {
        let found = self
            .backend
            .resources(ResourceKind::Jail)
            .and_then(|jails| resource::find_one(jails, &self.request.jail, ResourceKind::Jail));
        let jail = match found {
            Ok(jail) => jail,
            Err(e) => return self.finish(Verdict::Rejected(e)),
        };

        let dest = match self.destination(&jail) {
            Ok(dest) => dest,
            Err(e) => return self.finish(Verdict::Rejected(e)),
        };
        match ExportWriter::create(&dest, self.request.format) {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => return self.finish(Verdict::Rejected(e)),
        }
        tracing::debug!("exporting {} to {}", jail.full_name(), dest.display());
        self.jail = Some(jail);

        let standalone = self.request.standalone;
        self.run_step(EventKind::ExportConfig, Phase::Fstab, |writer, jail| {
            let metadata = ExportMetadata::new(&jail.name, &jail.source, standalone, &jail.properties);
            writer.add_bytes(METADATA_FILE, &serde_json::to_vec_pretty(&metadata)?)?;
            writer.add_bytes("config.json", &serde_json::to_vec_pretty(&jail.properties)?)
        })
    }

    fn fstab(&mut self) -> Option<Step> {
        self.run_step(EventKind::ExportFstab, Phase::Root, |writer, jail| {
            let fstab = jail.fstab_path();
            if fstab.exists() {
                writer.add_file("fstab", &fstab)
            } else {
                writer.add_bytes("fstab", b"")
            }
        })
    }

    fn root(&mut self) -> Option<Step> {
        let backend = self.backend;
        if self.request.standalone {
            self.run_step(EventKind::ExportRoot, Phase::Write, |writer, jail| {
                writer.add_generated("root.zfs", |path: &Path| backend.send_root(jail, path))
            })
        } else {
            self.run_step(EventKind::ExportRoot, Phase::Write, |writer, jail| {
                writer.add_tree("root", &jail.root_path())
            })
        }
    }

    fn write(&mut self) -> Option<Step> {
        let (Some(jail), Some(writer)) = (self.jail.take(), self.writer.take()) else {
            return self.finish(Verdict::Rejected(Error::InvalidInput(
                "export was not started".into(),
            )));
        };
        let target = jail.full_name();
        let path = writer.path().to_path_buf();

        self.phase = Phase::Done;
        match writer.finish() {
            Ok(path) => {
                self.outcome.succeeded.push(target.clone());
                Some(Step::Event(
                    LifecycleEvent::done(EventKind::WriteExport, &target)
                        .with_message(format!("Exported {} to {}", target, path.display())),
                ))
            }
            Err(e) => {
                let event = LifecycleEvent::failed(EventKind::WriteExport, &target, &e);
                self.outcome.fail(target, e);
                remove_partial(&path);
                Some(Step::Event(event))
            }
        }
    }
}

/// Remove an export this operation created but could not complete
fn remove_partial(path: &Path) {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => tracing::info!("removed incomplete export {}", path.display()),
        Err(e) => tracing::warn!("could not remove incomplete export {}: {}", path.display(), e),
    }
}

impl Iterator for ExportOperation<'_> {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Start => self.start(),
            Phase::Fstab => self.fstab(),
            Phase::Root => self.root(),
            Phase::Write => self.write(),
            Phase::Done => {
                self.writer = None;
                let outcome = std::mem::take(&mut self.outcome);
                self.finish(Verdict::Completed(outcome))
            }
            Phase::Finished => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::read_metadata;
    use crate::host::fake::FakeBackend;
    use crate::lifecycle::drain;
    use crate::lifecycle::testing::RecordingReporter;

    /// Fake backend whose `web` jail lives in `dir`
    fn backend_in(dir: &Path) -> FakeBackend {
        let backend = FakeBackend::new().with_jail("web", &[("release", "14.2-RELEASE")]);
        backend.jails.borrow_mut()[0].mountpoint = dir.join("web");
        fs::create_dir_all(dir.join("web/root/etc")).unwrap();
        fs::write(dir.join("web/root/etc/hosts"), "127.0.0.1 localhost\n").unwrap();
        fs::write(dir.join("web/fstab"), "/data\t/data\tnullfs\tro\t0\t0\n").unwrap();
        backend
    }

    fn request(dest: PathBuf, format: ExportFormat, standalone: bool) -> ExportRequest {
        ExportRequest {
            jail: ResourceIdentifier::parse("web").unwrap(),
            destination: dest,
            standalone,
            format,
        }
    }

    fn kinds(reporter: &RecordingReporter) -> Vec<EventKind> {
        reporter.events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_archive_export() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(dir.path());
        let dest = dir.path().join("web.tar.zst");

        let mut reporter = RecordingReporter::default();
        let op = ExportOperation::new(&backend, request(dest.clone(), ExportFormat::Archive, false));
        let verdict = drain(op, &mut reporter);

        assert!(verdict.is_success());
        assert_eq!(
            kinds(&reporter),
            vec![
                EventKind::ExportConfig,
                EventKind::ExportFstab,
                EventKind::ExportRoot,
                EventKind::WriteExport
            ]
        );
        let metadata = read_metadata(&dest).unwrap();
        assert_eq!(metadata.name, "web");
        assert_eq!(metadata.release.as_deref(), Some("14.2-RELEASE"));
        assert!(!metadata.standalone);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_existing_file_is_rejected_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(dir.path());
        let dest = dir.path().join("web.tar.zst");
        fs::write(&dest, "previous export").unwrap();
        let before: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();

        let mut reporter = RecordingReporter::default();
        let op = ExportOperation::new(&backend, request(dest.clone(), ExportFormat::Archive, false));
        let verdict = drain(op, &mut reporter);

        assert!(matches!(verdict, Verdict::Rejected(Error::InvalidInput(_))));
        assert!(reporter.events.is_empty());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "previous export");
        let after: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn test_directory_export_into_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(dir.path());
        let exports = dir.path().join("exports");
        fs::create_dir(&exports).unwrap();

        let mut reporter = RecordingReporter::default();
        let op = ExportOperation::new(&backend, request(exports.clone(), ExportFormat::Directory, false));
        assert!(drain(op, &mut reporter).is_success());

        let out = exports.join("web");
        assert_eq!(
            fs::read_to_string(out.join("root/etc/hosts")).unwrap(),
            "127.0.0.1 localhost\n"
        );
        assert!(fs::read_to_string(out.join("fstab")).unwrap().starts_with("/data"));
        let config: std::collections::BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(out.join("config.json")).unwrap()).unwrap();
        assert_eq!(config.get("release").map(String::as_str), Some("14.2-RELEASE"));
        assert_eq!(
            reporter.messages(),
            vec![format!("Exported zroot/web to {}", out.display())]
        );
    }

    #[test]
    fn test_standalone_sends_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(dir.path());
        let dest = dir.path().join("standalone");

        let mut reporter = RecordingReporter::default();
        let op = ExportOperation::new(&backend, request(dest.clone(), ExportFormat::Directory, true));
        assert!(drain(op, &mut reporter).is_success());

        assert_eq!(backend.calls(), vec!["send web"]);
        assert_eq!(fs::read_to_string(dest.join("root.zfs")).unwrap(), "zfs stream of web");
        assert!(!dest.join("root").exists());
        assert!(read_metadata(&dest).unwrap().standalone);
    }

    #[test]
    fn test_failed_send_stops_export() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(dir.path()).failing_on("web");
        let dest = dir.path().join("web.tar.zst");

        let mut reporter = RecordingReporter::default();
        let op = ExportOperation::new(&backend, request(dest, ExportFormat::Archive, true));
        let verdict = drain(op, &mut reporter);

        assert_eq!(verdict.exit_code(), 1);
        let last = reporter.events.last().unwrap();
        assert_eq!(last.kind, EventKind::ExportRoot);
        assert!(!last.done);
        assert_eq!(reporter.failures.len(), 1);
        assert!(!dir.path().join("web.tar.zst").exists());
    }

    #[test]
    fn test_failed_directory_export_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("web-export");

        let failing = backend_in(dir.path()).failing_on("web");
        let op = ExportOperation::new(&failing, request(dest.clone(), ExportFormat::Directory, true));
        assert_eq!(drain(op, &mut RecordingReporter::default()).exit_code(), 1);
        assert!(!dest.exists());

        let backend = backend_in(dir.path());
        let op = ExportOperation::new(&backend, request(dest.clone(), ExportFormat::Directory, true));
        assert!(drain(op, &mut RecordingReporter::default()).is_success());
        assert!(read_metadata(&dest).unwrap().standalone);
    }

    #[test]
    fn test_unknown_jail() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_in(dir.path());
        let mut req = request(dir.path().join("x"), ExportFormat::Archive, false);
        req.jail = ResourceIdentifier::parse("db").unwrap();

        let verdict = drain(ExportOperation::new(&backend, req), &mut RecordingReporter::default());
        assert!(matches!(verdict, Verdict::Rejected(Error::NotFound { .. })));
        assert!(!dir.path().join("x").exists());
    }
}
