use serde::Serialize;
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};

use crate::context::{format_rfc3339, Clock};
use crate::ids::{generate_stamped_id, lock_token};
use crate::settings::non_empty;
use crate::sun::cas::read_document;
use crate::sun::{cas_mutate, CasDocument, ObjectStore, KIND_TASKBOARD};

use super::agent::{AgentIdentity, DEFAULT_LEASE_SECONDS, MAX_LEASE_SECONDS};
use super::model::{sort_for_display, Board, Lock, Priority, Task, TaskStatus};
use super::TaskboardError;

impl CasDocument for Board {
    type Error = TaskboardError;
    const CONTENT_TYPE: &'static str = "application/json";

    fn empty(name: &str) -> Self {
        Board::new(name)
    }

    fn decode(name: &str, payload: &[u8]) -> Result<Self, TaskboardError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Board::new(name));
        }
        let mut board: Board =
            serde_json::from_slice(payload).map_err(|err| TaskboardError::Decode {
                board: name.to_string(),
                reason: err.to_string(),
            })?;
        board.normalize(name);
        Ok(board)
    }

    fn encode(&self) -> Result<Vec<u8>, TaskboardError> {
        serde_json::to_vec_pretty(self).map_err(|err| TaskboardError::Decode {
            board: self.name.clone(),
            reason: err.to_string(),
        })
    }

    fn metadata(&self) -> Map<String, Value> {
        let counts = self.counts();
        let mut metadata = Map::new();
        metadata.insert("tasks_total".to_string(), Value::from(self.tasks.len()));
        metadata.insert("tasks_todo".to_string(), Value::from(counts.todo));
        metadata.insert("tasks_doing".to_string(), Value::from(counts.doing));
        metadata.insert("tasks_done".to_string(), Value::from(counts.done));
        metadata
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardView {
    pub revision: i64,
    pub board: Board,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask<'a> {
    pub title: &'a str,
    pub prompt: Option<&'a str>,
    pub priority: Priority,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub task_id: Option<&'a str>,
    pub agent: &'a AgentIdentity,
    /// Non-positive values fall back to 1800 seconds.
    pub lease_seconds: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter<'a> {
    pub status: Option<TaskStatus>,
    pub owner: Option<&'a str>,
    /// Zero means unlimited.
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimOutcome {
    pub board: String,
    pub task: Task,
}

/// Taskboard operations over one store. Every mutation re-reads the board
/// and takes a fresh timestamp on each CAS attempt.
pub struct Taskboard<'a> {
    store: &'a dyn ObjectStore,
    clock: &'a dyn Clock,
}

impl<'a> Taskboard<'a> {
    pub fn new(store: &'a dyn ObjectStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    pub fn show(&self, name: &str) -> Result<BoardView, TaskboardError> {
        let name = checked_name(name)?;
        Ok(match read_document::<Board>(self.store, KIND_TASKBOARD, name)? {
            Some((board, meta)) => BoardView {
                revision: meta.latest_revision,
                board,
            },
            None => BoardView {
                revision: 0,
                board: Board::new(name),
            },
        })
    }

    pub fn list(&self, name: &str, filter: ListFilter<'_>) -> Result<Vec<Task>, TaskboardError> {
        let owner = non_empty(filter.owner);
        let mut tasks = self
            .show(name)?
            .board
            .tasks
            .into_iter()
            .filter(|task| filter.status.map_or(true, |status| task.status == status))
            .filter(|task| {
                owner.map_or(true, |owner| {
                    task.assignment
                        .as_ref()
                        .is_some_and(|lock| lock.is_held_by(owner))
                })
            })
            .collect::<Vec<_>>();
        sort_for_display(&mut tasks);
        if filter.limit > 0 {
            tasks.truncate(filter.limit);
        }
        Ok(tasks)
    }

    pub fn add(&self, name: &str, new: &NewTask<'_>) -> Result<Task, TaskboardError> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(TaskboardError::InvalidArgument(
                "--title is required".to_string(),
            ));
        }
        let prompt = non_empty(new.prompt).unwrap_or(title).trim();
        let tags = new
            .tags
            .iter()
            .map(|tag| tag.trim())
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        self.mutate(name, |board, now| {
            let stamp = format_rfc3339(now);
            let task = Task {
                id: generate_stamped_id("tsk", now, |candidate| {
                    board.find_task(candidate).is_some()
                }),
                title: title.to_string(),
                prompt: prompt.to_string(),
                status: TaskStatus::Todo,
                priority: new.priority,
                tags: tags.clone(),
                created_at: stamp.clone(),
                updated_at: stamp,
                ..Task::default()
            };
            board.tasks.push(task.clone());
            Ok(task)
        })
    }

    /// Claims `task_id`, or the best candidate when none is given. A lock
    /// held by another live agent is never taken over, even after a retry.
    pub fn claim(&self, name: &str, request: ClaimRequest<'_>) -> Result<ClaimOutcome, TaskboardError> {
        let agent = checked_agent(request.agent)?;
        let lease = if request.lease_seconds > 0 {
            request.lease_seconds
        } else {
            DEFAULT_LEASE_SECONDS
        };
        if lease > MAX_LEASE_SECONDS {
            return Err(TaskboardError::InvalidArgument(format!(
                "lease of {lease}s exceeds the {MAX_LEASE_SECONDS}s maximum"
            )));
        }
        let task = self.mutate(name, |board, now| {
            let index = match non_empty(request.task_id) {
                Some(id) => board
                    .find_task(id)
                    .ok_or_else(|| TaskboardError::TaskNotFound(id.trim().to_string()))?,
                None => board
                    .next_claimable(now)
                    .ok_or_else(|| TaskboardError::NoClaimable(board.name.clone()))?,
            };
            let expires = now
                .checked_add(time::Duration::seconds(lease))
                .ok_or_else(|| {
                    TaskboardError::InvalidArgument(format!("lease of {lease}s is out of range"))
                })?;
            let stamp = format_rfc3339(now);
            let task = &mut board.tasks[index];
            if task.status == TaskStatus::Done {
                return Err(TaskboardError::AlreadyDone(task.id.clone()));
            }
            if let Some(lock) = &task.assignment {
                if !lock.is_expired(now) && !lock.is_held_by(&agent.agent_id) {
                    return Err(TaskboardError::NotOwner {
                        task: task.id.clone(),
                        owner: lock.agent_id.clone(),
                    });
                }
            }
            task.status = TaskStatus::Doing;
            task.updated_at = stamp.clone();
            task.assignment = Some(Lock {
                agent_id: agent.agent_id.clone(),
                dyad: agent.dyad.clone(),
                machine: agent.machine.clone(),
                user: agent.user.clone(),
                lock_token: lock_token(now),
                claimed_at: stamp.clone(),
                lease_seconds: lease,
                lease_expires_at: format_rfc3339(expires),
            });
            let claimed = task.clone();
            touch_agent(board, agent, &stamp, "working", &claimed.id);
            clear_other_agents(board, &agent.agent_id, &claimed.id, &stamp);
            Ok(claimed)
        })?;
        tracing::debug!(board = name, task = %task.id, agent = %agent.agent_id, "task claimed");
        Ok(ClaimOutcome {
            board: name.trim().to_string(),
            task,
        })
    }

    pub fn autopilot_claim_next(
        &self,
        name: &str,
        agent: &AgentIdentity,
        lease_seconds: i64,
    ) -> Result<ClaimOutcome, TaskboardError> {
        self.claim(
            name,
            ClaimRequest {
                task_id: None,
                agent,
                lease_seconds,
            },
        )
    }

    /// Drops the lock. `doing` goes back to `todo`; `done` stays `done`.
    pub fn release(
        &self,
        name: &str,
        task_id: &str,
        agent: &AgentIdentity,
    ) -> Result<Task, TaskboardError> {
        let agent = checked_agent(agent)?;
        self.mutate(name, |board, now| {
            let index = board
                .find_task(task_id)
                .ok_or_else(|| TaskboardError::TaskNotFound(task_id.trim().to_string()))?;
            let stamp = format_rfc3339(now);
            let task = &mut board.tasks[index];
            let Some(lock) = task.assignment.take() else {
                return Err(TaskboardError::NotAssigned(task.id.clone()));
            };
            let other = !lock.is_held_by(&agent.agent_id);
            if other && !lock.is_expired(now) {
                return Err(TaskboardError::NotOwner {
                    task: task.id.clone(),
                    owner: lock.agent_id,
                });
            }
            if task.status != TaskStatus::Done {
                task.status = TaskStatus::Todo;
            }
            task.updated_at = stamp.clone();
            let released = task.clone();
            touch_agent(board, agent, &stamp, "idle", "");
            if other {
                set_agent_state(board, &lock.agent_id, &stamp, "idle", "");
            }
            Ok(released)
        })
    }

    /// Completes a task owned by `agent`, unlocked, or held under an
    /// expired lease.
    pub fn done(
        &self,
        name: &str,
        task_id: &str,
        agent: &AgentIdentity,
        result: Option<&str>,
    ) -> Result<Task, TaskboardError> {
        let agent = checked_agent(agent)?;
        self.mutate(name, |board, now| {
            let index = board
                .find_task(task_id)
                .ok_or_else(|| TaskboardError::TaskNotFound(task_id.trim().to_string()))?;
            let stamp = format_rfc3339(now);
            let task = &mut board.tasks[index];
            if let Some(lock) = &task.assignment {
                if !lock.is_expired(now) && !lock.is_held_by(&agent.agent_id) {
                    return Err(TaskboardError::NotOwner {
                        task: task.id.clone(),
                        owner: lock.agent_id.clone(),
                    });
                }
            }
            task.status = TaskStatus::Done;
            task.assignment = None;
            task.updated_at = stamp.clone();
            task.completed_at = stamp.clone();
            if let Some(result) = non_empty(result) {
                task.result = result.trim().to_string();
            }
            let completed = task.clone();
            touch_agent(board, agent, &stamp, "idle", "");
            clear_other_agents(board, &agent.agent_id, &completed.id, &stamp);
            Ok(completed)
        })
    }

    fn mutate<T>(
        &self,
        name: &str,
        mut apply: impl FnMut(&mut Board, OffsetDateTime) -> Result<T, TaskboardError>,
    ) -> Result<T, TaskboardError> {
        let name = checked_name(name)?;
        let outcome = cas_mutate::<Board, _, _>(self.store, KIND_TASKBOARD, name, |board| {
            let now = self.clock.now().to_offset(UtcOffset::UTC);
            let value = apply(board, now)?;
            board.updated_at = format_rfc3339(now);
            Ok(value)
        })?;
        tracing::debug!(
            board = name,
            revision = outcome.put.revision,
            attempts = outcome.attempts,
            "taskboard updated"
        );
        Ok(outcome.value)
    }
}

/// Splits `a, b,,c` into trimmed, non-empty tags.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn checked_name(name: &str) -> Result<&str, TaskboardError> {
    non_empty(Some(name))
        .map(str::trim)
        .ok_or_else(|| TaskboardError::InvalidArgument("taskboard name required".to_string()))
}

fn checked_agent(agent: &AgentIdentity) -> Result<&AgentIdentity, TaskboardError> {
    if agent.agent_id.trim().is_empty() {
        return Err(TaskboardError::InvalidArgument(
            "agent id required".to_string(),
        ));
    }
    Ok(agent)
}

fn touch_agent(board: &mut Board, identity: &AgentIdentity, stamp: &str, status: &str, task: &str) {
    let agent = board.agent_mut(identity.agent_id.trim());
    for (slot, value) in [
        (&mut agent.dyad, &identity.dyad),
        (&mut agent.machine, &identity.machine),
        (&mut agent.user, &identity.user),
    ] {
        if !value.trim().is_empty() {
            *slot = value.trim().to_string();
        }
    }
    agent.status = status.to_string();
    agent.current_task_id = task.to_string();
    agent.last_seen_at = stamp.to_string();
}

fn set_agent_state(board: &mut Board, agent_id: &str, stamp: &str, status: &str, task: &str) {
    let agent_id = agent_id.trim();
    if agent_id.is_empty() {
        return;
    }
    let agent = board.agent_mut(agent_id);
    agent.status = status.to_string();
    agent.current_task_id = task.to_string();
    agent.last_seen_at = stamp.to_string();
}

fn clear_other_agents(board: &mut Board, keep: &str, task: &str, stamp: &str) {
    for (id, agent) in &mut board.agents {
        if id.trim().eq_ignore_ascii_case(keep.trim())
            || !agent.current_task_id.trim().eq_ignore_ascii_case(task.trim())
        {
            continue;
        }
        agent.current_task_id.clear();
        agent.status = "idle".to_string();
        agent.last_seen_at = stamp.to_string();
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
