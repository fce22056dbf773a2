use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::context::{format_rfc3339, parse_rfc3339, Clock};
use crate::ids::generate_stamped_id;
use crate::settings::non_empty;
use crate::sun::{
    cas_mutate, read_document, CasDocument, ObjectStore, PutRequest, KIND_MACHINE_JOB,
    KIND_MACHINE_REGISTRY,
};

use super::runner::JobRunner;
use super::{
    clean_command, job_name_prefix, job_object_name, sanitize_machine_id, sanitize_operator_id,
    truncate_output,
    Capabilities, JobStatus, MachineError, MachineJob, MachineRecord, MAX_TIMEOUT_SECONDS,
    MIN_TIMEOUT_SECONDS,
};

pub const DEFAULT_LIST_LIMIT: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct Registration<'a> {
    pub machine_id: &'a str,
    pub operator_id: &'a str,
    pub display_name: Option<&'a str>,
    pub allow_operators: Vec<String>,
    /// `None` keeps the stored value, or the default for a new machine.
    pub can_control_others: Option<bool>,
    pub can_be_controlled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineUpdate {
    pub machine: MachineRecord,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct JobRequest<'a> {
    pub target: &'a str,
    pub source: &'a str,
    pub operator: &'a str,
    pub command: &'a [String],
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter<'a> {
    pub machine: Option<&'a str>,
    pub requested_by: Option<&'a str>,
    pub status: Option<JobStatus>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct ServeOptions<'a> {
    pub machine_id: &'a str,
    pub poll: Duration,
    pub once: bool,
    /// Zero means unlimited.
    pub max_jobs: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServeSummary {
    pub machine_id: String,
    pub processed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub job_ids: Vec<String>,
}

pub struct Dispatcher<'a> {
    store: &'a dyn ObjectStore,
    clock: &'a dyn Clock,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a dyn ObjectStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    fn stamp(&self) -> String {
        format_rfc3339(self.clock.now())
    }

    pub fn register(&self, registration: &Registration<'_>) -> Result<MachineUpdate, MachineError> {
        let machine_id = sanitize_machine_id(required(registration.machine_id, "machine id")?);
        let operator_id = sanitize_operator_id(required(registration.operator_id, "operator id")?);
        let operator_id = operator_id.as_str();
        let outcome = cas_mutate::<MachineRecord, _, _>(
            self.store,
            KIND_MACHINE_REGISTRY,
            &machine_id,
            |record| {
                let now = self.stamp();
                let fresh = record.owner_operator.is_empty();
                if fresh {
                    record.owner_operator = operator_id.to_string();
                    record.registered_at = now.clone();
                    record.capabilities = Capabilities {
                        can_control_others: registration.can_control_others.unwrap_or(false),
                        can_be_controlled: registration.can_be_controlled.unwrap_or(true),
                    };
                } else if !record.is_owner(operator_id) {
                    return Err(MachineError::Denied(format!(
                        "machine {machine_id:?} is owned by {:?}",
                        record.owner_operator
                    )));
                } else {
                    if let Some(value) = registration.can_control_others {
                        record.capabilities.can_control_others = value;
                    }
                    if let Some(value) = registration.can_be_controlled {
                        record.capabilities.can_be_controlled = value;
                    }
                }
                if let Some(name) = non_empty(registration.display_name) {
                    record.display_name = name.to_string();
                }
                record.acl.allowed_operators.push(operator_id.to_string());
                record
                    .acl
                    .allowed_operators
                    .extend(registration.allow_operators.iter().cloned());
                record.updated_at = now.clone();
                record.heartbeat.last_seen_at = now;
                record.heartbeat.last_state = "registered".to_string();
                record.normalize(&machine_id);
                Ok(record.clone())
            },
        )?;
        tracing::debug!(machine = %machine_id, revision = outcome.put.revision, "machine registered");
        Ok(MachineUpdate {
            machine: outcome.value,
            revision: outcome.put.revision,
        })
    }

    pub fn status(&self, machine_id: &str) -> Result<MachineRecord, MachineError> {
        let machine_id = sanitize_machine_id(required(machine_id, "machine id")?);
        self.load(&machine_id)?
            .map(|(record, _)| record)
            .ok_or(MachineError::NotRegistered(machine_id))
    }

    pub fn list(&self, limit: usize) -> Result<Vec<MachineRecord>, MachineError> {
        let mut records = Vec::new();
        for meta in self.store.list_objects(KIND_MACHINE_REGISTRY, limit)? {
            match self.load(&meta.name) {
                Ok(Some((record, _))) => records.push(record),
                Ok(None) => {}
                Err(err) => tracing::warn!(machine = %meta.name, error = %err, "skipping unreadable machine record"),
            }
        }
        records.sort_by(|left, right| left.machine_id.cmp(&right.machine_id));
        Ok(records)
    }

    /// Adds `grant` to the ACL. Only the owner may do this.
    pub fn allow(&self, machine_id: &str, grant: &str, caller: &str) -> Result<MachineUpdate, MachineError> {
        let grant = required(grant, "--grant")?;
        self.update_acl(machine_id, caller, "grant", |record| {
            record.acl.allowed_operators.push(grant.to_string());
            Ok(())
        })
    }

    /// Removes `revoke` from the ACL. The owner itself cannot be revoked.
    pub fn deny(&self, machine_id: &str, revoke: &str, caller: &str) -> Result<MachineUpdate, MachineError> {
        let revoke = required(revoke, "--revoke")?;
        self.update_acl(machine_id, caller, "revoke", |record| {
            if record.is_owner(revoke) {
                return Err(MachineError::InvalidArgument(format!(
                    "cannot revoke owner operator {:?}",
                    record.owner_operator
                )));
            }
            record
                .acl
                .allowed_operators
                .retain(|operator| !operator.eq_ignore_ascii_case(revoke));
            Ok(())
        })
    }

    fn update_acl(
        &self,
        machine_id: &str,
        caller: &str,
        verb: &str,
        mut change: impl FnMut(&mut MachineRecord) -> Result<(), MachineError>,
    ) -> Result<MachineUpdate, MachineError> {
        let machine_id = sanitize_machine_id(machine_id);
        self.status(&machine_id)?;
        let outcome = cas_mutate::<MachineRecord, _, _>(
            self.store,
            KIND_MACHINE_REGISTRY,
            &machine_id,
            |record| {
                if !record.is_owner(caller) {
                    return Err(MachineError::Denied(format!(
                        "only machine owner {:?} can {verb} operators",
                        record.owner_operator
                    )));
                }
                change(record)?;
                record.updated_at = self.stamp();
                record.normalize(&machine_id);
                Ok(record.clone())
            },
        )?;
        Ok(MachineUpdate {
            machine: outcome.value,
            revision: outcome.put.revision,
        })
    }

    /// Validates both ends of the request and queues the job with
    /// `expected_revision = 0`.
    pub fn submit(&self, request: &JobRequest<'_>) -> Result<MachineJob, MachineError> {
        let command = clean_command(request.command);
        if command.is_empty() {
            return Err(MachineError::InvalidArgument(
                "a si command is required after --".to_string(),
            ));
        }
        let operator = required(request.operator, "operator id")?;
        let target = self.status(request.target)?;
        if !target.capabilities.can_be_controlled {
            return Err(MachineError::Denied(format!(
                "target machine {:?} does not accept remote control (can_be_controlled=false)",
                target.machine_id
            )));
        }
        if !target.allows(operator) {
            return Err(MachineError::Denied(format!(
                "operator {operator:?} is not allowed to control machine {:?}",
                target.machine_id
            )));
        }
        let source = self.status(request.source)?;
        if !source.allows(operator) {
            return Err(MachineError::Denied(format!(
                "operator {operator:?} is not allowed on source machine {:?}",
                source.machine_id
            )));
        }
        if !source.capabilities.can_control_others {
            return Err(MachineError::Denied(format!(
                "source machine {:?} cannot control other machines (can_control_others=false)",
                source.machine_id
            )));
        }

        let now = self.clock.now();
        let stamp = format_rfc3339(now);
        let job_id = generate_stamped_id("job", now, |candidate| {
            matches!(
                self.store
                    .lookup_meta(KIND_MACHINE_JOB, &job_object_name(&target.machine_id, candidate)),
                Ok(Some(_))
            )
        });
        let mut job = MachineJob {
            version: 1,
            job_id,
            machine_id: target.machine_id.clone(),
            requested_by: operator.to_string(),
            source_machine: source.machine_id.clone(),
            command,
            timeout_seconds: request.timeout_seconds,
            status: JobStatus::Queued,
            requested_at: stamp.clone(),
            updated_at: stamp,
            ..MachineJob::default()
        };
        job.normalize();
        self.put_job(&job, 0)?;
        tracing::debug!(job = %job.job_id, machine = %job.machine_id, "queued machine job");
        Ok(job)
    }

    pub fn load_job(&self, name: &str) -> Result<Option<(MachineJob, i64)>, MachineError> {
        Ok(read_document::<MachineJob>(self.store, KIND_MACHINE_JOB, name.trim())?
            .map(|(job, meta)| (job, meta.latest_revision)))
    }

    /// Polls until the job reaches a terminal status.
    pub fn wait(&self, name: &str, timeout: Duration, poll: Duration) -> Result<MachineJob, MachineError> {
        let started = Instant::now();
        loop {
            let (job, _) = self
                .load_job(name)?
                .ok_or_else(|| MachineError::JobNotFound(name.trim().to_string()))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if started.elapsed() >= timeout {
                return Err(MachineError::WaitTimeout(job.job_id));
            }
            thread::sleep(poll);
        }
    }

    pub fn jobs(&self, filter: &JobFilter<'_>) -> Result<Vec<MachineJob>, MachineError> {
        let machine = non_empty(filter.machine).map(sanitize_machine_id);
        let requested_by = non_empty(filter.requested_by);
        let mut jobs = self
            .queue(filter.limit)?
            .into_iter()
            .map(|(_, job)| job)
            .filter(|job| {
                machine
                    .as_deref()
                    .map_or(true, |machine| job.machine_id.eq_ignore_ascii_case(machine))
            })
            .filter(|job| {
                requested_by.map_or(true, |operator| job.requested_by.eq_ignore_ascii_case(operator))
            })
            .filter(|job| filter.status.map_or(true, |status| job.status == status))
            .collect::<Vec<_>>();
        sort_by_request(&mut jobs, |job| job);
        Ok(jobs)
    }

    pub fn heartbeat(&self, machine_id: &str, state: &str) -> Result<MachineRecord, MachineError> {
        let machine_id = sanitize_machine_id(machine_id);
        self.status(&machine_id)?;
        let outcome = cas_mutate::<MachineRecord, _, _>(
            self.store,
            KIND_MACHINE_REGISTRY,
            &machine_id,
            |record| {
                let now = self.stamp();
                record.heartbeat.last_seen_at = now.clone();
                record.heartbeat.last_state = state.to_string();
                record.updated_at = now;
                Ok(record.clone())
            },
        )?;
        Ok(outcome.value)
    }

    /// Claims the oldest queued job for `machine_id`. Each candidate gets a
    /// single conditional write; losing a race moves on to the next one.
    pub fn claim_next(&self, machine_id: &str) -> Result<Option<(MachineJob, i64)>, MachineError> {
        let prefix = job_name_prefix(machine_id).to_ascii_lowercase();
        let mut candidates = self
            .queue(DEFAULT_LIST_LIMIT)?
            .into_iter()
            .filter(|(name, job)| {
                name.to_ascii_lowercase().starts_with(&prefix) && job.status == JobStatus::Queued
            })
            .collect::<Vec<_>>();
        sort_by_request(&mut candidates, |(_, job)| job);

        for (name, _) in candidates {
            let Some((mut job, revision)) = self.load_job(&name)? else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            let now = self.stamp();
            job.status = JobStatus::Running;
            job.claimed_by = sanitize_machine_id(machine_id);
            job.claimed_at = now.clone();
            job.started_at = now.clone();
            job.updated_at = now;
            match self.put_job(&job, revision) {
                Ok(revision) => return Ok(Some((job, revision))),
                Err(MachineError::Sun(err)) if err.is_conflict() => {
                    tracing::debug!(job = %name, "machine job claimed elsewhere");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Runs a claimed job, re-checking the machine ACL first.
    pub fn execute(&self, mut job: MachineJob, machine: &MachineRecord, runner: &dyn JobRunner) -> MachineJob {
        let started = self.stamp();
        if job.started_at.is_empty() {
            job.started_at = started.clone();
        }
        let denial = if !machine.allows(&job.requested_by) {
            Some(format!(
                "operator {:?} is not allowed by machine {:?} ACL",
                job.requested_by, machine.machine_id
            ))
        } else if !machine.capabilities.can_be_controlled {
            Some(format!("machine {:?} refuses remote control", machine.machine_id))
        } else {
            None
        };
        if let Some(reason) = denial {
            job.status = JobStatus::Denied;
            job.exit_code = 1;
            job.error = reason;
            job.completed_at = started.clone();
            job.updated_at = started;
            return job;
        }

        // Remote jobs are not trusted to have been normalized.
        let timeout = Duration::from_secs(
            job.timeout_seconds
                .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS),
        );
        let output = runner.run(&job.command, timeout);
        let completed = self.stamp();
        job.stdout = truncate_output(&output.stdout);
        job.stderr = truncate_output(&output.stderr);
        job.exit_code = output.exit_code;
        job.completed_at = completed.clone();
        job.updated_at = completed;
        match output.error {
            Some(error) => {
                job.status = JobStatus::Failed;
                job.error = error.trim().to_string();
            }
            None if output.exit_code != 0 => {
                job.status = JobStatus::Failed;
                job.error = format!("command exited with code {}", output.exit_code);
            }
            None => {
                job.status = JobStatus::Succeeded;
                job.error.clear();
            }
        }
        job
    }

    pub fn serve(&self, options: &ServeOptions<'_>, runner: &dyn JobRunner) -> Result<ServeSummary, MachineError> {
        let machine_id = sanitize_machine_id(options.machine_id);
        let record = self.status(&machine_id)?;
        if !record.capabilities.can_be_controlled {
            return Err(MachineError::Denied(format!(
                "machine {machine_id:?} is not accepting remote jobs (can_be_controlled=false)"
            )));
        }
        self.heartbeat(&machine_id, "serving")?;
        let mut summary = ServeSummary {
            machine_id: machine_id.clone(),
            ..ServeSummary::default()
        };
        let done = |summary: &ServeSummary| {
            options.once || (options.max_jobs > 0 && summary.processed >= options.max_jobs)
        };
        loop {
            match self.claim_next(&machine_id)? {
                Some((job, revision)) => {
                    tracing::debug!(job = %job.job_id, command = %job.command.join(" "), "running machine job");
                    let record = self.status(&machine_id)?;
                    let finished = self.execute(job, &record, runner);
                    self.put_job(&finished, revision)?;
                    summary.processed += 1;
                    summary.job_ids.push(finished.job_id);
                }
                None if done(&summary) => break,
                None => {
                    thread::sleep(options.poll);
                    continue;
                }
            }
            if done(&summary) {
                break;
            }
        }
        Ok(summary)
    }

    fn load(&self, machine_id: &str) -> Result<Option<(MachineRecord, i64)>, MachineError> {
        Ok(
            read_document::<MachineRecord>(self.store, KIND_MACHINE_REGISTRY, machine_id.trim())?
                .map(|(record, meta)| (record, meta.latest_revision)),
        )
    }

    fn queue(&self, limit: usize) -> Result<Vec<(String, MachineJob)>, MachineError> {
        let mut jobs = Vec::new();
        for meta in self.store.list_objects(KIND_MACHINE_JOB, limit)? {
            match self.load_job(&meta.name) {
                Ok(Some((job, _))) => jobs.push((meta.name, job)),
                Ok(None) => {}
                Err(err) => tracing::warn!(job = %meta.name, error = %err, "skipping unreadable machine job"),
            }
        }
        Ok(jobs)
    }

    fn put_job(&self, job: &MachineJob, expected_revision: i64) -> Result<i64, MachineError> {
        let payload = job.encode()?;
        let put = self.store.put_object(PutRequest {
            kind: KIND_MACHINE_JOB,
            name: &job.object_name(),
            payload: &payload,
            content_type: MachineJob::CONTENT_TYPE,
            metadata: job.metadata(),
            expected_revision: Some(expected_revision),
        })?;
        Ok(put.revision)
    }
}

fn required<'s>(value: &'s str, what: &str) -> Result<&'s str, MachineError> {
    non_empty(Some(value)).ok_or_else(|| MachineError::InvalidArgument(format!("{what} is required")))
}

fn sort_by_request<T>(items: &mut [T], job: impl Fn(&T) -> &MachineJob) {
    items.sort_by(|left, right| {
        let (left, right) = (job(left), job(right));
        parse_rfc3339(&left.requested_at)
            .cmp(&parse_rfc3339(&right.requested_at))
            .then_with(|| left.job_id.cmp(&right.job_id))
    });
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
