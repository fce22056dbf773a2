use std::collections::HashMap;
use std::path::PathBuf;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::settings::{Settings, SettingsError};

pub const SUN_BASE_URL_KEYS: &[&str] = &["SI_SUN_BASE_URL", "SI_HELIA_BASE_URL"];
pub const SUN_TOKEN_KEYS: &[&str] = &["SI_SUN_TOKEN", "SI_HELIA_TOKEN"];
pub const SUN_ALLOW_INSECURE_KEYS: &[&str] =
    &["SI_SUN_ALLOW_INSECURE_HTTP", "SI_HELIA_ALLOW_INSECURE_HTTP"];
pub const TASKBOARD_KEYS: &[&str] = &["SI_SUN_TASKBOARD", "SI_HELIA_TASKBOARD"];
pub const TASKBOARD_AGENT_KEYS: &[&str] = &["SI_SUN_TASKBOARD_AGENT", "SI_HELIA_TASKBOARD_AGENT"];
pub const TASKBOARD_LEASE_KEYS: &[&str] = &[
    "SI_SUN_TASKBOARD_LEASE_SECONDS",
    "SI_HELIA_TASKBOARD_LEASE_SECONDS",
];
pub const MACHINE_ID_KEYS: &[&str] = &["SI_SUN_MACHINE_ID", "SI_HELIA_MACHINE_ID"];
pub const OPERATOR_ID_KEYS: &[&str] = &["SI_SUN_OPERATOR_ID", "SI_HELIA_OPERATOR_ID"];
pub const USER_KEYS: &[&str] = &["USER", "USERNAME"];

/// Snapshot of the process environment taken once per invocation.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
    hostname: Option<String>,
}

impl Env {
    pub fn capture() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|value| value.into_string().ok());
        Self {
            vars: std::env::vars().collect(),
            hostname,
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            hostname: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// First non-empty value among `keys`, in order.
    pub fn first(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn flag(&self, keys: &[&str]) -> bool {
        self.first(keys).is_some_and(is_truthy)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[cfg(test)]
#[derive(Debug)]
pub struct FixedClock(pub std::cell::Cell<OffsetDateTime>);

#[cfg(test)]
impl FixedClock {
    pub fn at(rfc3339: &str) -> Self {
        let instant = OffsetDateTime::parse(rfc3339, &Rfc3339).expect("valid test timestamp");
        Self(std::cell::Cell::new(instant))
    }

    pub fn advance(&self, seconds: i64) {
        self.0.set(self.0.get() + time::Duration::seconds(seconds));
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0.get()
    }
}

/// RFC-3339 UTC rendering truncated to whole seconds.
pub fn format_rfc3339(instant: OffsetDateTime) -> String {
    let truncated = instant
        .to_offset(time::UtcOffset::UTC)
        .replace_nanosecond(0)
        .unwrap_or(instant);
    truncated
        .format(&Rfc3339)
        .unwrap_or_else(|_| truncated.unix_timestamp().to_string())
}

pub fn parse_rfc3339(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    OffsetDateTime::parse(trimmed, &Rfc3339).ok()
}

/// Filesystem layout under the state home.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn resolve(env: &Env) -> Result<Self, SettingsError> {
        let home = env
            .get("SI_SETTINGS_HOME")
            .or_else(|| env.get("HOME"))
            .ok_or(SettingsError::HomeUnavailable)?;
        Ok(Self::under(PathBuf::from(home)))
    }

    pub fn under(home: PathBuf) -> Self {
        Self {
            root: home.join(".si"),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.root.join("vault")
    }

    pub fn key_file(&self) -> PathBuf {
        self.vault_dir().join("keys").join("age.key")
    }

    pub fn sun_auth_file(&self) -> PathBuf {
        self.root.join("sun").join("auth.json")
    }
}

/// Everything a command needs, threaded explicitly instead of read from globals.
pub struct CommandContext {
    pub env: Env,
    pub paths: StatePaths,
    pub settings: Settings,
    pub clock: Box<dyn Clock>,
}

impl CommandContext {
    pub fn load(env: Env) -> Result<Self, SettingsError> {
        let paths = StatePaths::resolve(&env)?;
        let settings = Settings::load(&paths.settings_file())?;
        Ok(Self {
            env,
            paths,
            settings,
            clock: Box::new(SystemClock),
        })
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn save_settings(&self) -> Result<(), SettingsError> {
        self.settings.save(&self.paths.settings_file())
    }
}
