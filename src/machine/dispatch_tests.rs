use std::cell::RefCell;
use std::time::Duration;

use super::{Dispatcher, JobFilter, JobRequest, Registration, ServeOptions};
use crate::context::FixedClock;
use crate::machine::runner::{JobRunner, RunOutput};
use crate::machine::{JobStatus, MachineError, MachineJob, MAX_TIMEOUT_SECONDS};
use crate::sun::memory::MemoryStore;
use crate::sun::{ObjectStore, KIND_MACHINE_JOB};

const START: &str = "2026-03-01T12:00:00Z";
const OWNER: &str = "op:owner@target";
const CONTROLLER: &str = "op:ctl@laptop";

#[derive(Default)]
struct FakeRunner {
    output: RunOutput,
    calls: RefCell<Vec<Vec<String>>>,
}

impl FakeRunner {
    fn exiting(code: i32, stdout: &str) -> Self {
        Self {
            output: RunOutput {
                stdout: stdout.to_string(),
                exit_code: code,
                ..RunOutput::default()
            },
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl JobRunner for FakeRunner {
    fn run(&self, command: &[String], timeout: Duration) -> RunOutput {
        assert!(timeout >= Duration::from_secs(10));
        assert!(timeout <= Duration::from_secs(MAX_TIMEOUT_SECONDS));
        self.calls.borrow_mut().push(command.to_vec());
        self.output.clone()
    }
}

fn register_pair(dispatcher: &Dispatcher<'_>) {
    dispatcher
        .register(&Registration {
            machine_id: "target",
            operator_id: OWNER,
            allow_operators: vec![CONTROLLER.to_string()],
            ..Registration::default()
        })
        .expect("register target");
    dispatcher
        .register(&Registration {
            machine_id: "laptop",
            operator_id: CONTROLLER,
            can_control_others: Some(true),
            can_be_controlled: Some(false),
            ..Registration::default()
        })
        .expect("register laptop");
}

fn submit(dispatcher: &Dispatcher<'_>, command: &[String]) -> Result<MachineJob, MachineError> {
    dispatcher.submit(&JobRequest {
        target: "target",
        source: "laptop",
        operator: CONTROLLER,
        command,
        timeout_seconds: 30,
    })
}

fn args(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|arg| arg.to_string()).collect()
}

fn serve_once(dispatcher: &Dispatcher<'_>, runner: &FakeRunner) -> super::ServeSummary {
    dispatcher
        .serve(
            &ServeOptions {
                machine_id: "target",
                poll: Duration::ZERO,
                once: true,
                max_jobs: 0,
            },
            runner,
        )
        .expect("serve")
}

#[test]
fn register_sets_owner_defaults_and_rejects_other_operators() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);

    let first = dispatcher
        .register(&Registration {
            machine_id: "Build Box",
            operator_id: OWNER,
            display_name: Some("  CI runner "),
            ..Registration::default()
        })
        .expect("register");
    assert_eq!(first.revision, 1);
    let machine = &first.machine;
    assert_eq!(machine.machine_id, "build-box");
    assert_eq!(machine.display_name, "CI runner");
    assert_eq!(machine.owner_operator, OWNER);
    assert!(machine.capabilities.can_be_controlled);
    assert!(!machine.capabilities.can_control_others);
    assert_eq!(machine.acl.allowed_operators, vec![OWNER]);
    assert_eq!(machine.registered_at, START);
    assert_eq!(machine.heartbeat.last_state, "registered");

    clock.advance(60);
    let second = dispatcher
        .register(&Registration {
            machine_id: "build-box",
            operator_id: OWNER,
            can_control_others: Some(true),
            ..Registration::default()
        })
        .expect("re-register");
    assert_eq!(second.revision, 2);
    assert!(second.machine.capabilities.can_control_others);
    assert!(second.machine.capabilities.can_be_controlled);
    assert_eq!(second.machine.registered_at, START);
    assert_eq!(second.machine.display_name, "CI runner");

    let err = dispatcher
        .register(&Registration {
            machine_id: "build-box",
            operator_id: "op:intruder@x",
            ..Registration::default()
        })
        .expect_err("not the owner");
    assert!(matches!(err, MachineError::Denied(_)));

    let err = dispatcher.status("missing").expect_err("unregistered");
    assert!(matches!(err, MachineError::NotRegistered(_)));
    let listed = dispatcher.list(50).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].machine_id, "build-box");
}

#[test]
fn only_the_owner_changes_the_acl_and_cannot_revoke_itself() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);
    register_pair(&dispatcher);

    let err = dispatcher
        .allow("target", "op:friend@x", CONTROLLER)
        .expect_err("controller is not owner");
    assert!(matches!(err, MachineError::Denied(_)));

    let granted = dispatcher
        .allow("target", "op:friend@x", OWNER)
        .expect("grant");
    assert!(granted.machine.allows("op:friend@x"));

    let err = dispatcher.deny("target", OWNER, OWNER).expect_err("owner stays");
    assert!(matches!(err, MachineError::InvalidArgument(_)));

    let revoked = dispatcher.deny("target", "OP:FRIEND@X", OWNER).expect("revoke");
    assert!(!revoked.machine.allows("op:friend@x"));
    assert!(revoked.machine.allows(CONTROLLER));
    assert_eq!(revoked.revision, granted.revision + 1);

    let err = dispatcher
        .allow("ghost", "op:friend@x", OWNER)
        .expect_err("unregistered");
    assert!(matches!(err, MachineError::NotRegistered(_)));
}

#[test]
fn submit_checks_both_machines_before_queueing() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);
    let command = args(&["vault", "list"]);

    let err = submit(&dispatcher, &command).expect_err("nothing registered");
    assert!(matches!(err, MachineError::NotRegistered(_)));

    register_pair(&dispatcher);
    let err = submit(&dispatcher, &args(&["--", "si"])).expect_err("empty command");
    assert!(matches!(err, MachineError::InvalidArgument(_)));

    let err = dispatcher
        .submit(&JobRequest {
            target: "target",
            source: "laptop",
            operator: "op:stranger@x",
            command: &command,
            timeout_seconds: 30,
        })
        .expect_err("operator not in target ACL");
    assert!(matches!(err, MachineError::Denied(_)));

    let err = dispatcher
        .submit(&JobRequest {
            target: "laptop",
            source: "target",
            operator: CONTROLLER,
            command: &command,
            timeout_seconds: 30,
        })
        .expect_err("laptop refuses control");
    assert!(matches!(err, MachineError::Denied(ref msg) if msg.contains("can_be_controlled=false")));

    dispatcher
        .register(&Registration {
            machine_id: "laptop",
            operator_id: CONTROLLER,
            can_control_others: Some(false),
            ..Registration::default()
        })
        .expect("downgrade laptop");
    let err = submit(&dispatcher, &command).expect_err("source cannot control");
    assert!(matches!(err, MachineError::Denied(ref msg) if msg.contains("can_control_others=false")));
    assert!(store.list_objects(KIND_MACHINE_JOB, 10).expect("list").is_empty());
}

#[test]
fn serve_once_runs_a_queued_job_to_success() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);
    register_pair(&dispatcher);

    let job = submit(&dispatcher, &args(&["si", "vault", "list"])).expect("submit");
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.job_id.starts_with("job-20260301-120000-"));
    assert_eq!(job.command, vec!["vault", "list"]);
    assert_eq!(job.source_machine, "laptop");
    assert_eq!(store.latest_revision(KIND_MACHINE_JOB, &job.object_name()), 1);

    clock.advance(5);
    let runner = FakeRunner::exiting(0, "KEY\n");
    let summary = serve_once(&dispatcher, &runner);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.job_ids, vec![job.job_id.clone()]);
    assert_eq!(runner.calls.borrow().as_slice(), &[args(&["vault", "list"])]);

    assert_eq!(store.latest_revision(KIND_MACHINE_JOB, &job.object_name()), 3);
    let (finished, revision) = dispatcher
        .load_job(&job.object_name())
        .expect("load")
        .expect("exists");
    assert_eq!(revision, 3);
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(finished.claimed_by, "target");
    assert_eq!(finished.stdout, "KEY\n");
    assert_eq!(finished.completed_at, "2026-03-01T12:00:05Z");
    assert!(finished.clone().into_result().is_ok());

    let waited = dispatcher
        .wait(&job.object_name(), Duration::ZERO, Duration::ZERO)
        .expect("terminal");
    assert_eq!(waited.status, JobStatus::Succeeded);

    let idle = serve_once(&dispatcher, &runner);
    assert_eq!(idle.processed, 0);
    assert_eq!(dispatcher.status("target").expect("status").heartbeat.last_state, "serving");
}

#[test]
fn oversized_timeouts_are_capped_at_submit_and_execution() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);
    register_pair(&dispatcher);
    let command = args(&["vault", "list"]);
    let job = dispatcher
        .submit(&JobRequest {
            target: "target",
            source: "laptop",
            operator: CONTROLLER,
            command: &command,
            timeout_seconds: u64::MAX,
        })
        .expect("submit");
    assert_eq!(job.timeout_seconds, MAX_TIMEOUT_SECONDS);

    let unnormalized = MachineJob {
        timeout_seconds: u64::MAX,
        ..job
    };
    let machine = dispatcher.status("target").expect("status");
    let runner = FakeRunner::exiting(0, "");
    let finished = dispatcher.execute(unnormalized, &machine, &runner);
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(runner.calls.borrow().len(), 1);
}

#[test]
fn nonzero_exit_marks_the_job_failed() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);
    register_pair(&dispatcher);
    let job = submit(&dispatcher, &args(&["vault", "get", "MISSING"])).expect("submit");

    serve_once(&dispatcher, &FakeRunner::exiting(4, ""));
    let (finished, _) = dispatcher
        .load_job(&job.object_name())
        .expect("load")
        .expect("exists");
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(finished.exit_code, 4);
    assert_eq!(finished.error, "command exited with code 4");
    let err = finished.into_result().expect_err("failed");
    assert!(matches!(err, MachineError::JobFailed { status: JobStatus::Failed, .. }));
}

#[test]
fn claim_skips_a_job_lost_to_another_worker() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);
    register_pair(&dispatcher);
    let older = submit(&dispatcher, &args(&["vault", "list"])).expect("older");
    clock.advance(1);
    let newer = submit(&dispatcher, &args(&["vault", "list"])).expect("newer");

    store.inject_conflicts(1);
    let (claimed, revision) = dispatcher
        .claim_next("target")
        .expect("claim")
        .expect("a job");
    assert_eq!(claimed.job_id, newer.job_id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(revision, 2);

    let (left, _) = dispatcher
        .load_job(&older.object_name())
        .expect("load")
        .expect("exists");
    assert_eq!(left.status, JobStatus::Queued);
    let (next, _) = dispatcher
        .claim_next("target")
        .expect("claim")
        .expect("older job");
    assert_eq!(next.job_id, older.job_id);
    assert!(dispatcher.claim_next("target").expect("claim").is_none());
}

#[test]
fn revoked_operators_get_denied_at_execution() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);
    register_pair(&dispatcher);
    let job = submit(&dispatcher, &args(&["vault", "list"])).expect("submit");
    dispatcher.deny("target", CONTROLLER, OWNER).expect("revoke");

    let runner = FakeRunner::exiting(0, "");
    serve_once(&dispatcher, &runner);
    assert!(runner.calls.borrow().is_empty());
    let (finished, _) = dispatcher
        .load_job(&job.object_name())
        .expect("load")
        .expect("exists");
    assert_eq!(finished.status, JobStatus::Denied);
    assert_eq!(finished.exit_code, 1);
    assert!(finished.error.contains("is not allowed"));
}

#[test]
fn jobs_filter_and_wait_report_missing_or_pending_jobs() {
    let store = MemoryStore::new();
    let clock = FixedClock::at(START);
    let dispatcher = Dispatcher::new(&store, &clock);
    register_pair(&dispatcher);
    let first = submit(&dispatcher, &args(&["vault", "list"])).expect("first");
    clock.advance(1);
    let second = submit(&dispatcher, &args(&["vault", "status"])).expect("second");
    dispatcher.claim_next("target").expect("claim").expect("job");

    let all = dispatcher
        .jobs(&JobFilter {
            machine: Some("TARGET"),
            limit: 50,
            ..JobFilter::default()
        })
        .expect("jobs");
    let ids = all.iter().map(|job| job.job_id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec![first.job_id.as_str(), second.job_id.as_str()]);

    let queued = dispatcher
        .jobs(&JobFilter {
            status: Some(JobStatus::Queued),
            requested_by: Some(CONTROLLER),
            limit: 50,
            ..JobFilter::default()
        })
        .expect("jobs");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].job_id, second.job_id);
    assert!(dispatcher
        .jobs(&JobFilter {
            machine: Some("laptop"),
            limit: 50,
            ..JobFilter::default()
        })
        .expect("jobs")
        .is_empty());

    let err = dispatcher
        .wait(&second.object_name(), Duration::ZERO, Duration::ZERO)
        .expect_err("still queued");
    assert!(matches!(err, MachineError::WaitTimeout(_)));
    let err = dispatcher
        .wait("target--job-missing", Duration::ZERO, Duration::ZERO)
        .expect_err("missing");
    assert!(matches!(err, MachineError::JobNotFound(_)));
}
