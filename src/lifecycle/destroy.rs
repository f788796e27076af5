//! Destroy jails, templates or releases
//!
//! Every matched target is attempted. A failure is recorded and the next
//! target still runs; the verdict lists exactly which targets failed.

use crate::error::Error;
use crate::host::Backend;
use crate::jail::StateProbe;
use crate::lifecycle::{Confirm, EventKind, LifecycleEvent, OperationOutcome, Step, Verdict};
use crate::resource::filter::{self, PropertyBag};
use crate::resource::{Resource, ResourceKind, TargetKind};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct DestroyRequest {
    pub filters: Vec<String>,
    pub kind: TargetKind,
    /// Skip the confirmation and stop running jails first
    pub force: bool,
    /// Also remove resources cloned from the targets, without asking about them
    pub recursive: bool,
}

struct Candidate {
    resource: Resource,
    stop_first: bool,
}

enum Phase {
    Select,
    Targets,
    Finished,
}

/// Iterator destroying every matched target
pub struct DestroyOperation<'a> {
    backend: &'a dyn Backend,
    probe: &'a StateProbe,
    confirm: &'a mut dyn Confirm,
    request: DestroyRequest,
    phase: Phase,
    candidates: VecDeque<Candidate>,
    outcome: OperationOutcome,
}

impl<'a> DestroyOperation<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        probe: &'a StateProbe,
        confirm: &'a mut dyn Confirm,
        request: DestroyRequest,
    ) -> Self {
        Self {
            backend,
            probe,
            confirm,
            request,
            phase: Phase::Select,
            candidates: VecDeque::new(),
            outcome: OperationOutcome::default(),
        }
    }

    fn finish(&mut self, verdict: Verdict) -> Option<Step> {
        self.phase = Phase::Finished;
        Some(Step::Finished(verdict))
    }

    fn matched(&self) -> crate::error::Result<Vec<Resource>> {
        if self.request.filters.is_empty() {
            return Err(Error::InvalidInput(
                "No filter specified - cannot select a target to delete".into(),
            ));
        }

        let mut terms = self.request.filters.clone();
        if let Some(implicit) = self.request.kind.implicit_filter() {
            terms.push(implicit.to_string());
        }
        let filters = filter::compile(&terms)?;

        let resources = self.backend.resources(self.request.kind.resource_kind())?;
        let matched = filter::select(resources, &filters);
        if matched.is_empty() {
            return Err(Error::NoMatch {
                kind: self.request.kind.to_string(),
                filters: self.request.filters.join(" "),
            });
        }
        Ok(matched)
    }

    /// Resources cloned from `target`
    fn dependents(&self, target: &Resource, jails: &[Resource]) -> Vec<String> {
        let full_name = target.full_name();
        jails
            .iter()
            .filter(|j| j.full_name() != full_name)
            .filter(|j| match target.kind {
                ResourceKind::Release => {
                    j.source == target.source && j.property("release") == Some(target.name.as_str())
                }
                ResourceKind::Jail => j.property("origin") == Some(full_name.as_str()),
            })
            .map(Resource::full_name)
            .collect()
    }

    fn prompt(&self, matched: &[Resource]) -> crate::error::Result<String> {
        let jails = if self.request.recursive {
            Vec::new()
        } else {
            self.backend.resources(ResourceKind::Jail)?
        };

        let mut lines = vec![format!("These {} will be deleted", self.request.kind)];
        for resource in matched {
            let dependents = self.dependents(resource, &jails);
            if dependents.is_empty() {
                lines.push(resource.full_name());
            } else {
                lines.push(format!(
                    "{} (and its dependents: {})",
                    resource.full_name(),
                    dependents.join(", ")
                ));
            }
        }
        Ok(format!("{}\nAre you sure?", lines.join("\n- ")))
    }

    fn select(&mut self) -> Option<Step> {
        let matched = match self.matched() {
            Ok(matched) => matched,
            Err(e) => return self.finish(Verdict::Rejected(e)),
        };

        if !self.request.force {
            let answer = self
                .prompt(&matched)
                .and_then(|prompt| self.confirm.confirm(&prompt));
            match answer {
                Ok(true) => {}
                Ok(false) => return self.finish(Verdict::Aborted),
                Err(e) => return self.finish(Verdict::Rejected(e)),
            }
        }

        let running = if self.request.force && self.request.kind != TargetKind::Release {
            match self.probe.query_all() {
                Ok(table) => Some(table),
                Err(e) => return self.finish(Verdict::Rejected(e)),
            }
        } else {
            None
        };

        self.candidates = matched
            .into_iter()
            .map(|resource| Candidate {
                stop_first: running
                    .as_ref()
                    .is_some_and(|t| t.is_running(&resource.jail_name())),
                resource,
            })
            .collect();

        tracing::debug!("{} {} selected", self.candidates.len(), self.request.kind);
        self.phase = Phase::Targets;
        Some(Step::Event(LifecycleEvent::done(
            EventKind::SelectTargets,
            self.request.kind.to_string(),
        )))
    }

    fn next_target(&mut self) -> Option<Step> {
        let Some(mut candidate) = self.candidates.pop_front() else {
            let outcome = std::mem::take(&mut self.outcome);
            return self.finish(Verdict::Completed(outcome));
        };
        let target = candidate.resource.full_name();

        if candidate.stop_first {
            return match self.backend.stop_jail(&candidate.resource) {
                Ok(()) => {
                    candidate.stop_first = false;
                    self.candidates.push_front(candidate);
                    Some(Step::Event(LifecycleEvent::done(EventKind::StopJail, target)))
                }
                Err(e) => {
                    let event = LifecycleEvent::failed(EventKind::StopJail, &target, &e);
                    self.outcome.fail(target, e);
                    Some(Step::Event(event))
                }
            };
        }

        let mountpoint = candidate.resource.mountpoint.clone();
        match self
            .backend
            .destroy(&candidate.resource, self.request.recursive)
        {
            Ok(()) => {
                self.outcome.succeeded.push(target.clone());
                Some(Step::Event(
                    LifecycleEvent::done(EventKind::DestroyResource, target)
                        .with_message(format!("{} destroyed", mountpoint.display())),
                ))
            }
            Err(e) => {
                let event = LifecycleEvent::failed(EventKind::DestroyResource, &target, &e);
                self.outcome.fail(target, e);
                Some(Step::Event(event))
            }
        }
    }
}

impl Iterator for DestroyOperation<'_> {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        match self.phase {
            Phase::Select => self.select(),
            Phase::Targets => self.next_target(),
            Phase::Finished => None,
        }
    }
}
