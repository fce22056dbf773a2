use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::context::parse_rfc3339;

pub const BOARD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    #[default]
    Todo,
    Doing,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
        }
    }

    /// Lenient form used on read: anything unrecognised is `todo`.
    pub fn normalize(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }

    /// Display order: doing, todo, done.
    fn display_rank(self) -> u8 {
        match self {
            TaskStatus::Doing => 1,
            TaskStatus::Todo => 2,
            TaskStatus::Done => 3,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "todo" | "open" | "queued" | "backlog" => Ok(TaskStatus::Todo),
            "doing" | "in-progress" | "in_progress" | "claimed" | "active" => {
                Ok(TaskStatus::Doing)
            }
            "done" | "closed" | "complete" | "completed" => Ok(TaskStatus::Done),
            _ => Err(format!(
                "invalid status {:?} (expected todo|doing|done)",
                value.trim()
            )),
        }
    }
}

impl From<String> for TaskStatus {
    fn from(raw: String) -> Self {
        TaskStatus::normalize(&raw)
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Priority {
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }

    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "P1" => Priority::P1,
            "P3" => Priority::P3,
            _ => Priority::P2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Priority {
    fn from(raw: String) -> Self {
        Priority::normalize(&raw)
    }
}

impl From<Priority> for String {
    fn from(priority: Priority) -> Self {
        priority.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dyad: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lock_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claimed_at: String,
    #[serde(default)]
    pub lease_seconds: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lease_expires_at: String,
}

impl Lock {
    /// A lock with no parseable expiry information never expires.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        if let Some(expires) = parse_rfc3339(&self.lease_expires_at) {
            return now >= expires;
        }
        if self.lease_seconds > 0 {
            if let Some(claimed) = parse_rfc3339(&self.claimed_at) {
                return claimed
                    .checked_add(time::Duration::seconds(self.lease_seconds))
                    .is_some_and(|expires| now >= expires);
            }
        }
        false
    }

    pub fn is_held_by(&self, agent_id: &str) -> bool {
        self.agent_id.trim().eq_ignore_ascii_case(agent_id.trim())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub completed_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Lock>,
}

impl Task {
    /// Claimable by anyone: not done, and unlocked or holding an expired lock.
    pub fn is_candidate(&self, now: OffsetDateTime) -> bool {
        self.status != TaskStatus::Done
            && self
                .assignment
                .as_ref()
                .map_or(true, |lock| lock.is_expired(now))
    }

    pub fn owner(&self) -> Option<&str> {
        self.assignment.as_ref().map(|lock| lock.agent_id.as_str())
    }

    fn created(&self) -> Option<OffsetDateTime> {
        parse_rfc3339(&self.created_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dyad: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_seen_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub todo: usize,
    pub doing: usize,
    pub done: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_at: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub agents: BTreeMap<String, Agent>,
}

impl Board {
    pub fn new(name: &str) -> Self {
        Self {
            version: BOARD_VERSION,
            name: name.trim().to_string(),
            ..Self::default()
        }
    }

    /// Repairs a payload written by any client into the canonical shape.
    pub fn normalize(&mut self, fallback_name: &str) {
        self.version = self.version.max(BOARD_VERSION);
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            self.name = fallback_name.trim().to_string();
        }
        for task in &mut self.tasks {
            task.id = task.id.trim().to_string();
            task.title = task.title.trim().to_string();
            task.prompt = task.prompt.trim().to_string();
            if task.prompt.is_empty() {
                task.prompt = task.title.clone();
            }
            if let Some(lock) = &mut task.assignment {
                lock.agent_id = lock.agent_id.trim().to_string();
            }
            if task
                .assignment
                .as_ref()
                .is_some_and(|lock| lock.agent_id.is_empty())
            {
                task.assignment = None;
            }
        }
        for (id, agent) in &mut self.agents {
            if agent.id.trim().is_empty() {
                agent.id = id.clone();
            }
        }
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Todo => counts.todo += 1,
                TaskStatus::Doing => counts.doing += 1,
                TaskStatus::Done => counts.done += 1,
            }
        }
        counts
    }

    pub fn find_task(&self, id: &str) -> Option<usize> {
        let needle = id.trim();
        self.tasks
            .iter()
            .position(|task| task.id.eq_ignore_ascii_case(needle))
    }

    /// Best claim candidate: lowest priority rank, then oldest, then id.
    pub fn next_claimable(&self, now: OffsetDateTime) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.is_candidate(now))
            .min_by(|(_, left), (_, right)| {
                left.priority
                    .cmp(&right.priority)
                    .then_with(|| compare_created(left, right))
                    .then_with(|| left.id.cmp(&right.id))
            })
            .map(|(index, _)| index)
    }

    pub fn agent_mut(&mut self, id: &str) -> &mut Agent {
        let agent = self.agents.entry(id.to_string()).or_default();
        agent.id = id.to_string();
        agent
    }
}

/// Orders tasks for display: status, priority, creation time, id.
pub fn sort_for_display(tasks: &mut [Task]) {
    tasks.sort_by(|left, right| {
        left.status
            .display_rank()
            .cmp(&right.status.display_rank())
            .then_with(|| left.priority.cmp(&right.priority))
            .then_with(|| compare_created(left, right))
            .then_with(|| left.id.cmp(&right.id))
    });
}

// Unparseable timestamps sort first, like a zero time.
fn compare_created(left: &Task, right: &Task) -> Ordering {
    left.created().cmp(&right.created())
}

#[cfg(test)]
mod tests {
    use super::{sort_for_display, Board, Lock, Priority, Task, TaskStatus};
    use crate::context::parse_rfc3339;

    fn task(id: &str, status: TaskStatus, priority: Priority, created_at: &str) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            status,
            priority,
            created_at: created_at.to_string(),
            ..Task::default()
        }
    }

    #[test]
    fn statuses_and_priorities_normalize_leniently_on_read() {
        let raw = r#"{"name":" shared ","tasks":[
            {"id":" a ","title":"A","status":"in-progress","priority":"p1"},
            {"id":"b","title":"B","status":"weird","priority":"urgent"},
            {"id":"c","title":"C","status":"Closed","assignment":{"agent_id":"  "}}
        ]}"#;
        let mut board: Board = serde_json::from_str(raw).expect("board should parse");
        board.normalize("fallback");
        assert_eq!(board.version, 1);
        assert_eq!(board.name, "shared");
        let shapes = board
            .tasks
            .iter()
            .map(|task| (task.id.as_str(), task.status, task.priority, task.prompt.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            shapes,
            vec![
                ("a", TaskStatus::Doing, Priority::P1, "A"),
                ("b", TaskStatus::Todo, Priority::P2, "B"),
                ("c", TaskStatus::Done, Priority::P2, "C"),
            ]
        );
        assert!(board.tasks[2].assignment.is_none());

        let encoded = serde_json::to_value(&board).expect("encode");
        assert_eq!(encoded["tasks"][0]["status"], "doing");
        assert_eq!(encoded["tasks"][0]["priority"], "P1");
    }

    #[test]
    fn status_filters_reject_unknown_values() {
        assert_eq!("open".parse::<TaskStatus>(), Ok(TaskStatus::Todo));
        assert_eq!("completed".parse::<TaskStatus>(), Ok(TaskStatus::Done));
        assert!("blocked".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn lock_expiry_prefers_explicit_deadline_then_lease() {
        let now = parse_rfc3339("2026-03-01T12:00:00Z").expect("ts");
        let explicit = Lock {
            agent_id: "a".to_string(),
            lease_expires_at: "2026-03-01T12:00:00Z".to_string(),
            ..Lock::default()
        };
        assert!(explicit.is_expired(now));

        let leased = Lock {
            agent_id: "a".to_string(),
            claimed_at: "2026-03-01T11:59:00Z".to_string(),
            lease_seconds: 120,
            ..Lock::default()
        };
        assert!(!leased.is_expired(now));
        assert!(leased.is_expired(now + time::Duration::seconds(60)));

        let open_ended = Lock {
            agent_id: "a".to_string(),
            ..Lock::default()
        };
        assert!(!open_ended.is_expired(now));

        let unbounded = Lock {
            agent_id: "a".to_string(),
            claimed_at: "2026-03-01T11:59:00Z".to_string(),
            lease_seconds: i64::MAX,
            ..Lock::default()
        };
        assert!(!unbounded.is_expired(now));
    }

    #[test]
    fn claim_selection_prefers_priority_then_age_then_id() {
        let now = parse_rfc3339("2026-03-01T12:00:00Z").expect("ts");
        let mut board = Board::new("shared");
        board.tasks = vec![
            task("t-low", TaskStatus::Todo, Priority::P3, "2026-03-01T09:00:00Z"),
            task("t-b", TaskStatus::Todo, Priority::P1, "2026-03-01T10:00:00Z"),
            task("t-a", TaskStatus::Todo, Priority::P1, "2026-03-01T10:00:00Z"),
            task("t-done", TaskStatus::Done, Priority::P1, "2026-03-01T08:00:00Z"),
        ];
        assert_eq!(board.next_claimable(now), Some(2));

        board.tasks[2].assignment = Some(Lock {
            agent_id: "other".to_string(),
            lease_expires_at: "2026-03-01T13:00:00Z".to_string(),
            ..Lock::default()
        });
        assert_eq!(board.next_claimable(now), Some(1));
    }

    #[test]
    fn display_order_puts_doing_first_and_done_last() {
        let mut tasks = vec![
            task("done", TaskStatus::Done, Priority::P1, "2026-03-01T08:00:00Z"),
            task("todo-p2", TaskStatus::Todo, Priority::P2, "2026-03-01T08:00:00Z"),
            task("todo-p1", TaskStatus::Todo, Priority::P1, "2026-03-01T09:00:00Z"),
            task("doing", TaskStatus::Doing, Priority::P3, "2026-03-01T10:00:00Z"),
        ];
        sort_for_display(&mut tasks);
        let ids = tasks.iter().map(|task| task.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["doing", "todo-p1", "todo-p2", "done"]);
    }
}
