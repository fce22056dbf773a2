//! Remote `si` job dispatch between registered machines. Registrations live
//! in `machine_registry` objects and queued jobs in `machine_job` objects
//! named `<machine>--<job-id>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{Env, MACHINE_ID_KEYS, OPERATOR_ID_KEYS, USER_KEYS};
use crate::error::ErrKind;
use crate::settings::{non_empty, Settings};
use crate::sun::{CasDocument, SunError};
use crate::taskboard::agent::sanitize_component;

pub mod dispatch;
pub mod runner;

pub use dispatch::Dispatcher;

pub const OUTPUT_LIMIT_BYTES: usize = 64 * 1024;
pub const MIN_TIMEOUT_SECONDS: u64 = 10;
pub const MAX_TIMEOUT_SECONDS: u64 = 24 * 60 * 60;
const TRUNCATED_MARKER: &str = "\n[truncated]";

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("machine {0:?} is not registered")]
    NotRegistered(String),
    #[error("{0}")]
    Denied(String),
    #[error("remote job {0:?} not found")]
    JobNotFound(String),
    #[error("timed out waiting for remote job {0}")]
    WaitTimeout(String),
    #[error("remote job {job} finished with status {status}: {detail}")]
    JobFailed {
        job: String,
        status: JobStatus,
        detail: String,
    },
    #[error("{name} payload is invalid: {reason}")]
    Decode { name: String, reason: String },
    #[error(transparent)]
    Sun(#[from] SunError),
}

impl MachineError {
    pub fn kind(&self) -> ErrKind {
        match self {
            MachineError::InvalidArgument(_)
            | MachineError::Denied(_)
            | MachineError::JobFailed { .. } => ErrKind::InvalidArgument,
            MachineError::NotRegistered(_) | MachineError::JobNotFound(_) => ErrKind::NotFound,
            MachineError::WaitTimeout(_) => ErrKind::Network,
            MachineError::Decode { .. } => ErrKind::Decode,
            MachineError::Sun(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub can_control_others: bool,
    #[serde(default)]
    pub can_be_controlled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_operators: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_seen_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default)]
    pub owner_operator: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registered_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub acl: AccessControl,
    #[serde(default)]
    pub heartbeat: Heartbeat,
}

impl MachineRecord {
    /// Sanitises ids and keeps the owner inside the ACL.
    pub fn normalize(&mut self, fallback_id: &str) {
        self.version = self.version.max(1);
        let id = non_empty(Some(self.machine_id.as_str())).unwrap_or(fallback_id);
        self.machine_id = sanitize_machine_id(id);
        self.owner_operator = sanitize_operator_id(&self.owner_operator);
        self.display_name = self.display_name.trim().to_string();
        let mut operators = std::mem::take(&mut self.acl.allowed_operators);
        if !self.owner_operator.is_empty() {
            operators.push(self.owner_operator.clone());
        }
        self.acl.allowed_operators = normalize_operator_ids(operators);
    }

    pub fn is_owner(&self, operator: &str) -> bool {
        !operator.trim().is_empty() && self.owner_operator.eq_ignore_ascii_case(operator.trim())
    }

    pub fn allows(&self, operator: &str) -> bool {
        let operator = operator.trim();
        !operator.is_empty()
            && (self.is_owner(operator)
                || self
                    .acl
                    .allowed_operators
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(operator)))
    }
}

impl CasDocument for MachineRecord {
    type Error = MachineError;
    const CONTENT_TYPE: &'static str = "application/json";

    fn empty(name: &str) -> Self {
        MachineRecord {
            version: 1,
            machine_id: name.to_string(),
            ..MachineRecord::default()
        }
    }

    fn decode(name: &str, payload: &[u8]) -> Result<Self, MachineError> {
        let mut record: MachineRecord = decode_json(name, payload)?;
        record.normalize(name);
        Ok(record)
    }

    fn encode(&self) -> Result<Vec<u8>, MachineError> {
        encode_json(&self.machine_id, self)
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("machine_id".to_string(), Value::from(self.machine_id.clone()));
        metadata.insert(
            "owner_operator".to_string(),
            Value::from(self.owner_operator.clone()),
        );
        metadata.insert(
            "can_control_others".to_string(),
            Value::from(self.capabilities.can_control_others),
        );
        metadata.insert(
            "can_be_controlled".to_string(),
            Value::from(self.capabilities.can_be_controlled),
        );
        metadata.insert(
            "allowed_operators_n".to_string(),
            Value::from(self.acl.allowed_operators.len()),
        );
        metadata
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Denied,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Denied => "denied",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Denied
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "queued" | "pending" => Ok(JobStatus::Queued),
            "running" | "claimed" => Ok(JobStatus::Running),
            "succeeded" | "success" | "ok" => Ok(JobStatus::Succeeded),
            "failed" | "error" => Ok(JobStatus::Failed),
            "denied" | "forbidden" => Ok(JobStatus::Denied),
            _ => Err(format!(
                "invalid status {:?} (expected queued|running|succeeded|failed|denied)",
                value.trim()
            )),
        }
    }
}

// Unrecognised states read back as failed so `serve` never picks them up.
impl From<String> for JobStatus {
    fn from(raw: String) -> Self {
        raw.parse().unwrap_or(JobStatus::Failed)
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineJob {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_machine: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requested_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claimed_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claimed_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub started_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub completed_at: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl MachineJob {
    pub fn normalize(&mut self) {
        self.version = self.version.max(1);
        self.job_id = self.job_id.trim().to_string();
        self.machine_id = sanitize_machine_id(&self.machine_id);
        self.requested_by = sanitize_operator_id(&self.requested_by);
        self.source_machine = sanitize_machine_id(&self.source_machine);
        self.timeout_seconds = self
            .timeout_seconds
            .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);
        self.command = clean_command(&self.command);
    }

    pub fn object_name(&self) -> String {
        job_object_name(&self.machine_id, &self.job_id)
    }

    /// `Ok` for a succeeded job, otherwise the failure as an error.
    pub fn into_result(self) -> Result<MachineJob, MachineError> {
        if self.status == JobStatus::Succeeded {
            return Ok(self);
        }
        let detail = match (self.error.trim(), self.exit_code) {
            ("", 0) => "no details".to_string(),
            ("", code) => format!("exit code {code}"),
            (error, _) => error.to_string(),
        };
        Err(MachineError::JobFailed {
            job: self.job_id,
            status: self.status,
            detail,
        })
    }
}

impl CasDocument for MachineJob {
    type Error = MachineError;
    const CONTENT_TYPE: &'static str = "application/json";

    fn empty(_name: &str) -> Self {
        MachineJob::default()
    }

    fn decode(name: &str, payload: &[u8]) -> Result<Self, MachineError> {
        let mut job: MachineJob = decode_json(name, payload)?;
        job.normalize();
        Ok(job)
    }

    fn encode(&self) -> Result<Vec<u8>, MachineError> {
        encode_json(&self.job_id, self)
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("machine_id".to_string(), Value::from(self.machine_id.clone()));
        metadata.insert("job_id".to_string(), Value::from(self.job_id.clone()));
        metadata.insert("status".to_string(), Value::from(self.status.as_str()));
        metadata.insert(
            "requested_by".to_string(),
            Value::from(self.requested_by.clone()),
        );
        metadata
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(name: &str, payload: &[u8]) -> Result<T, MachineError> {
    serde_json::from_slice(payload).map_err(|err| MachineError::Decode {
        name: name.to_string(),
        reason: err.to_string(),
    })
}

fn encode_json<T: Serialize>(name: &str, value: &T) -> Result<Vec<u8>, MachineError> {
    serde_json::to_vec_pretty(value).map_err(|err| MachineError::Decode {
        name: name.to_string(),
        reason: err.to_string(),
    })
}

/// Lowercase `[a-z0-9._-]`, other characters folded to `-`.
pub fn sanitize_machine_id(raw: &str) -> String {
    sanitize_component(raw)
}

/// Like machine ids but case-preserving and also allowing `:` and `@`.
pub fn sanitize_operator_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':' | '@') {
                ch
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Sanitised, de-duplicated case-insensitively, sorted.
pub fn normalize_operator_ids<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::BTreeSet::new();
    let mut out = values
        .into_iter()
        .map(|value| sanitize_operator_id(value.as_ref()))
        .filter(|value| !value.is_empty())
        .filter(|value| seen.insert(value.to_ascii_lowercase()))
        .collect::<Vec<_>>();
    out.sort();
    out
}

/// explicit > env > `sun.machine_id` > hostname > `machine-unknown`.
pub fn resolve_machine_id(env: &Env, settings: &Settings, explicit: Option<&str>) -> String {
    [
        non_empty(explicit),
        env.first(MACHINE_ID_KEYS),
        non_empty(settings.sun.machine_id.as_deref()),
        env.hostname(),
    ]
    .into_iter()
    .flatten()
    .map(sanitize_machine_id)
    .find(|id| !id.is_empty())
    .unwrap_or_else(|| "machine-unknown".to_string())
}

/// explicit > env > `sun.operator_id` > `op:<user>@<machine>`.
pub fn resolve_operator_id(
    env: &Env,
    settings: &Settings,
    explicit: Option<&str>,
    machine_id: &str,
) -> String {
    let configured = [
        non_empty(explicit),
        env.first(OPERATOR_ID_KEYS),
        non_empty(settings.sun.operator_id.as_deref()),
    ]
    .into_iter()
    .flatten()
    .map(sanitize_operator_id)
    .find(|id| !id.is_empty());
    configured.unwrap_or_else(|| {
        let user = env
            .first(USER_KEYS)
            .map(sanitize_machine_id)
            .filter(|user| !user.is_empty())
            .unwrap_or_else(|| "user".to_string());
        sanitize_operator_id(&format!("op:{user}@{}", sanitize_machine_id(machine_id)))
    })
}

pub fn job_name_prefix(machine_id: &str) -> String {
    format!("{}--", sanitize_machine_id(machine_id))
}

pub fn job_object_name(machine_id: &str, job_id: &str) -> String {
    format!("{}{}", job_name_prefix(machine_id), job_id.trim())
}

/// Caps output at 64 KiB on a character boundary and marks the cut.
pub fn truncate_output(raw: &str) -> String {
    if raw.len() <= OUTPUT_LIMIT_BYTES {
        return raw.to_string();
    }
    let mut end = OUTPUT_LIMIT_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATED_MARKER}", &raw[..end])
}

/// Drops blank arguments and a leading `--` / `si`.
pub fn clean_command(args: &[String]) -> Vec<String> {
    let mut cleaned = args
        .iter()
        .map(|arg| arg.trim())
        .filter(|arg| !arg.is_empty())
        .collect::<Vec<_>>();
    if cleaned.first() == Some(&"--") {
        cleaned.remove(0);
    }
    if cleaned
        .first()
        .is_some_and(|first| first.eq_ignore_ascii_case("si"))
    {
        cleaned.remove(0);
    }
    cleaned.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::{
        clean_command, normalize_operator_ids, resolve_machine_id, resolve_operator_id,
        sanitize_operator_id, truncate_output, JobStatus, MachineJob, MachineRecord,
        OUTPUT_LIMIT_BYTES,
    };
    use crate::context::Env;
    use crate::settings::Settings;

    #[test]
    fn machine_ids_follow_precedence_and_sanitise() {
        let mut settings = Settings::default();
        let env = Env::default().with_hostname("Build Box.local");
        assert_eq!(resolve_machine_id(&env, &settings, None), "build-box.local");
        settings.sun.machine_id = Some("From-Settings".to_string());
        assert_eq!(resolve_machine_id(&env, &settings, None), "from-settings");
        let env = Env::from_pairs([("SI_HELIA_MACHINE_ID", "legacy")]);
        assert_eq!(resolve_machine_id(&env, &settings, None), "legacy");
        assert_eq!(resolve_machine_id(&env, &settings, Some("Explicit")), "explicit");
        assert_eq!(
            resolve_machine_id(&Env::default(), &Settings::default(), Some("!!!")),
            "machine-unknown"
        );
    }

    #[test]
    fn operator_ids_default_to_user_at_machine() {
        let env = Env::from_pairs([("USER", "Ada")]);
        let settings = Settings::default();
        assert_eq!(resolve_operator_id(&env, &settings, None, "box"), "op:ada@box");
        let env = Env::from_pairs([("SI_SUN_OPERATOR_ID", "Ops Team")]);
        assert_eq!(resolve_operator_id(&env, &settings, None, "box"), "Ops-Team");
        assert_eq!(sanitize_operator_id("  op:Ada@box!! "), "op:Ada@box");
    }

    #[test]
    fn operator_lists_dedupe_case_insensitively_and_sort() {
        let ids = normalize_operator_ids(["op:b@x", "OP:B@X", " ", "op:a@x"]);
        assert_eq!(ids, vec!["op:a@x", "op:b@x"]);
    }

    #[test]
    fn records_keep_the_owner_in_the_acl() {
        let mut record = MachineRecord {
            owner_operator: "op:owner@box".to_string(),
            ..MachineRecord::default()
        };
        record.normalize("Box-1");
        assert_eq!(record.machine_id, "box-1");
        assert_eq!(record.version, 1);
        assert_eq!(record.acl.allowed_operators, vec!["op:owner@box"]);
        assert!(record.allows("OP:OWNER@BOX"));
        assert!(!record.allows("op:other@box"));
        assert!(!record.allows(" "));
    }

    #[test]
    fn job_status_reads_aliases_and_failed_jobs_become_errors() {
        assert_eq!("pending".parse::<JobStatus>(), Ok(JobStatus::Queued));
        assert!("paused".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::from("weird".to_string()), JobStatus::Failed);

        let job = MachineJob {
            job_id: "job-1".to_string(),
            status: JobStatus::Failed,
            exit_code: 3,
            ..MachineJob::default()
        };
        let err = job.into_result().expect_err("failed job");
        assert_eq!(
            err.to_string(),
            "remote job job-1 finished with status failed: exit code 3"
        );
    }

    #[test]
    fn output_is_truncated_on_a_char_boundary() {
        let long = "é".repeat(OUTPUT_LIMIT_BYTES);
        let truncated = truncate_output(&long);
        assert!(truncated.ends_with("\n[truncated]"));
        assert!(truncated.len() <= OUTPUT_LIMIT_BYTES + "\n[truncated]".len());
        assert_eq!(truncate_output("short"), "short");
    }

    #[test]
    fn commands_drop_separator_and_program_name() {
        let args = ["--", "si", " vault ", "", "list"].map(String::from);
        assert_eq!(clean_command(&args), vec!["vault", "list"]);
    }

    #[test]
    fn jobs_clamp_timeouts() {
        let mut job = MachineJob {
            machine_id: "Box".to_string(),
            job_id: " job-1 ".to_string(),
            timeout_seconds: 3,
            ..MachineJob::default()
        };
        job.normalize();
        assert_eq!(job.timeout_seconds, 10);
        assert_eq!(job.object_name(), "box--job-1");

        job.timeout_seconds = u64::MAX;
        job.normalize();
        assert_eq!(job.timeout_seconds, 86_400);
    }
}
