use serde::Serialize;

use crate::context::{Env, TASKBOARD_AGENT_KEYS, TASKBOARD_KEYS, TASKBOARD_LEASE_KEYS, USER_KEYS};
use crate::settings::{non_empty, Settings};

pub const DEFAULT_BOARD: &str = "default";
pub const DEFAULT_LEASE_SECONDS: i64 = 1800;
pub const MAX_LEASE_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub dyad: String,
    pub machine: String,
    pub user: String,
}

impl AgentIdentity {
    /// `explicit` > env > `sun.taskboard_agent` > `dyad:<dyad-or-user>@<machine>`.
    pub fn resolve(
        env: &Env,
        settings: &Settings,
        explicit: Option<&str>,
        dyad: Option<&str>,
        machine: Option<&str>,
    ) -> Self {
        let machine = non_empty(machine)
            .or_else(|| env.hostname())
            .map(sanitize_component)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "machine".to_string());
        let user = env
            .first(USER_KEYS)
            .map(sanitize_component)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "user".to_string());
        let dyad = non_empty(dyad)
            .or_else(|| non_empty(settings.dyad.name.as_deref()))
            .map(sanitize_component)
            .unwrap_or_default();

        let agent_id = non_empty(explicit)
            .or_else(|| env.first(TASKBOARD_AGENT_KEYS))
            .or_else(|| non_empty(settings.sun.taskboard_agent.as_deref()))
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| {
                let base = if dyad.is_empty() { &user } else { &dyad };
                format!("dyad:{base}@{machine}")
            });

        Self {
            agent_id,
            dyad,
            machine,
            user,
        }
    }
}

/// Lowercases and maps anything outside `[a-z0-9._-]` to `-`.
pub fn sanitize_component(raw: &str) -> String {
    let mapped = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '-'
            }
        })
        .collect::<String>();
    mapped.trim_matches('-').to_string()
}

pub fn board_name(env: &Env, settings: &Settings, explicit: Option<&str>) -> String {
    non_empty(explicit)
        .or_else(|| env.first(TASKBOARD_KEYS))
        .or_else(|| non_empty(settings.sun.taskboard.as_deref()))
        .unwrap_or(DEFAULT_BOARD)
        .trim()
        .to_string()
}

/// A positive `explicit` wins; otherwise env, settings, then 1800 seconds.
pub fn lease_seconds(env: &Env, settings: &Settings, explicit: Option<i64>) -> i64 {
    if let Some(seconds) = explicit.filter(|seconds| *seconds > 0) {
        return seconds;
    }
    env.first(TASKBOARD_LEASE_KEYS)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|seconds| *seconds > 0)
        .or(settings.sun.taskboard_lease_seconds.filter(|seconds| *seconds > 0))
        .unwrap_or(DEFAULT_LEASE_SECONDS)
}
