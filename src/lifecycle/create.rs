//! Create jails from a release or a template
//!
//! The origin is resolved (and fetched when allowed) first, then one jail is
//! created per step. The first failed instance ends the batch; instances
//! created before it are left in place.

use crate::error::Error;
use crate::host::{Backend, NewJail, ReleaseStatus};
use crate::lifecycle::{EventKind, LifecycleEvent, OperationOutcome, Step, Verdict};
use crate::resource::selector::is_valid_name;
use crate::resource::{self, Resource, ResourceIdentifier, ResourceKind};
use std::collections::BTreeMap;

/// What new jails are built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Release(String),
    Template(ResourceIdentifier),
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: ResourceIdentifier,
    pub origin: Origin,
    pub count: u32,
    pub properties: BTreeMap<String, String>,
    pub basejail: bool,
    /// Download a missing release instead of failing
    pub fetch: bool,
}

impl CreateRequest {
    /// Name of the `index`-th instance (1-based)
    pub fn instance_name(&self, index: u32) -> String {
        if self.count > 1 {
            format!("{}_{}", self.name.name, index)
        } else {
            self.name.name.clone()
        }
    }
}

enum Phase {
    Resolve,
    Fetch(String),
    Instances,
    Finished,
}

/// Iterator creating `count` jails
pub struct CreateOperation<'a> {
    backend: &'a dyn Backend,
    request: CreateRequest,
    source: String,
    phase: Phase,
    origin: Option<Resource>,
    next_index: u32,
    outcome: OperationOutcome,
}

impl<'a> CreateOperation<'a> {
    pub fn new(backend: &'a dyn Backend, request: CreateRequest) -> Self {
        let primary = backend.sources().into_iter().next().unwrap_or_default();
        let source = request.name.source_or(&primary).to_string();
        Self {
            backend,
            request,
            source,
            phase: Phase::Resolve,
            origin: None,
            next_index: 1,
            outcome: OperationOutcome::default(),
        }
    }

    fn finish(&mut self, verdict: Verdict) -> Option<Step> {
        self.phase = Phase::Finished;
        Some(Step::Finished(verdict))
    }

    fn origin_label(&self) -> String {
        match &self.request.origin {
            Origin::Release(name) => name.clone(),
            Origin::Template(id) => id.to_string(),
        }
    }

    fn resolve(&mut self) -> Option<Step> {
        if self.request.count == 0 {
            return self.finish(Verdict::Rejected(Error::InvalidInput(
                "count must be at least 1".into(),
            )));
        }
        if !self.backend.sources().contains(&self.source) {
            return self.finish(Verdict::Rejected(Error::not_found("source", &self.source)));
        }

        let label = self.origin_label();
        match self.request.origin.clone() {
            Origin::Release(release) => self.resolve_release(release, label),
            Origin::Template(id) => self.resolve_template(id, label),
        }
    }

    fn resolve_release(&mut self, release: String, label: String) -> Option<Step> {
        if !is_valid_name(&release) {
            return self.finish(Verdict::Rejected(Error::InvalidResourceName(release)));
        }

        match self.backend.release_status(&self.source, &release) {
            Ok(ReleaseStatus::Fetched(found)) => {
                self.origin = Some(found);
                self.phase = Phase::Instances;
                Some(Step::Event(LifecycleEvent::done(EventKind::ResolveOrigin, label)))
            }
            Ok(ReleaseStatus::Available) if self.request.fetch => {
                self.phase = Phase::Fetch(release.clone());
                Some(Step::Event(
                    LifecycleEvent::done(EventKind::ResolveOrigin, label).with_message(format!(
                        "Automatically fetching release '{}'",
                        release
                    )),
                ))
            }
            Ok(ReleaseStatus::Available) => self.finish(Verdict::Rejected(Error::InvalidInput(
                format!(
                    "The release '{}' is available, but not downloaded yet",
                    release
                ),
            ))),
            Ok(ReleaseStatus::Unavailable) => {
                self.finish(Verdict::Rejected(Error::not_found("release", release)))
            }
            Err(e) => self.finish(Verdict::Rejected(e)),
        }
    }

    fn resolve_template(&mut self, id: ResourceIdentifier, label: String) -> Option<Step> {
        let found = self
            .backend
            .resources(ResourceKind::Jail)
            .and_then(|jails| resource::find_one(jails, &id, ResourceKind::Jail));

        match found {
            Ok(template) if template.is_template() => {
                self.origin = Some(template);
                self.phase = Phase::Instances;
                Some(Step::Event(LifecycleEvent::done(EventKind::ResolveOrigin, label)))
            }
            Ok(jail) => self.finish(Verdict::Rejected(Error::InvalidInput(format!(
                "{} is not a template",
                jail.full_name()
            )))),
            Err(e) => self.finish(Verdict::Rejected(e)),
        }
    }

    fn fetch(&mut self, release: String) -> Option<Step> {
        match self.backend.fetch_release(&self.source, &release) {
            Ok(fetched) => {
                self.origin = Some(fetched);
                self.phase = Phase::Instances;
                Some(Step::Event(LifecycleEvent::done(EventKind::FetchRelease, release)))
            }
            Err(e) => self.finish(Verdict::Rejected(e)),
        }
    }

    fn create_next(&mut self) -> Option<Step> {
        let Some(origin) = self.origin.clone() else {
            return self.finish(Verdict::Rejected(Error::InvalidInput(
                "no origin resolved".into(),
            )));
        };

        if self.next_index > self.request.count {
            let outcome = std::mem::take(&mut self.outcome);
            return self.finish(Verdict::Completed(outcome));
        }

        let index = self.next_index;
        self.next_index += 1;
        let new_jail = NewJail {
            source: self.source.clone(),
            name: self.request.instance_name(index),
            properties: self.request.properties.clone(),
            basejail: self.request.basejail,
        };
        let target = ResourceIdentifier::qualified(&new_jail.source, &new_jail.name).to_string();

        match self.backend.create_jail(&new_jail, &origin) {
            Ok(jail) => {
                tracing::info!("created {} at {}", target, jail.mountpoint.display());
                self.outcome.succeeded.push(target.clone());
                let on_source = if self.backend.sources().len() > 1 {
                    format!(" on {}", self.source)
                } else {
                    String::new()
                };
                let suffix = if self.request.count > 1 {
                    format!(" ({}/{})", index, self.request.count)
                } else {
                    String::new()
                };
                Some(Step::Event(
                    LifecycleEvent::done(EventKind::CreateJail, &target).with_message(format!(
                        "{} successfully created from {}{}!{}",
                        new_jail.name, origin.name, on_source, suffix
                    )),
                ))
            }
            Err(e) => {
                let event = LifecycleEvent::failed(EventKind::CreateJail, &target, &e);
                self.outcome.fail(target, e);
                // No further instances after a failure
                self.next_index = self.request.count + 1;
                Some(Step::Event(event))
            }
        }
    }
}

impl Iterator for CreateOperation<'_> {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        match std::mem::replace(&mut self.phase, Phase::Instances) {
            Phase::Resolve => self.resolve(),
            Phase::Fetch(release) => self.fetch(release),
            Phase::Instances => self.create_next(),
            Phase::Finished => {
                self.phase = Phase::Finished;
                None
            }
        }
    }
}
