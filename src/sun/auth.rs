use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::{Env, SUN_ALLOW_INSECURE_KEYS, SUN_BASE_URL_KEYS, SUN_TOKEN_KEYS};
use crate::fsio;
use crate::settings::{non_empty, SunSettings};

use super::SunError;

/// Contents of `<state>/sun/auth.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SunAuth {
    pub base_url: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SunCredentials {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub allow_insecure_http: bool,
}

impl SunCredentials {
    /// Environment first, then the auth file, then settings.
    pub fn resolve(
        env: &Env,
        auth_file: &Path,
        settings: &SunSettings,
    ) -> Result<Self, SunError> {
        let saved = load_auth(auth_file)?;
        let base_url = env
            .first(SUN_BASE_URL_KEYS)
            .or_else(|| saved.as_ref().and_then(|auth| non_empty(Some(auth.base_url.as_str()))))
            .or_else(|| non_empty(settings.base_url.as_deref()))
            .map(str::to_string);
        let token = env
            .first(SUN_TOKEN_KEYS)
            .or_else(|| saved.as_ref().and_then(|auth| non_empty(Some(auth.token.as_str()))))
            .or_else(|| non_empty(settings.token.as_deref()))
            .map(str::to_string);
        Ok(Self {
            base_url,
            token,
            allow_insecure_http: env.flag(SUN_ALLOW_INSECURE_KEYS),
        })
    }
}

pub fn load_auth(path: &Path) -> Result<Option<SunAuth>, SunError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SunError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| SunError::InvalidConfig(format!("invalid {}: {err}", path.display())))
}

pub fn save_auth(path: &Path, auth: &SunAuth) -> Result<(), SunError> {
    let rendered = serde_json::to_vec_pretty(auth)
        .map_err(|err| SunError::Decode(err.to_string()))?;
    fsio::write_atomic_with_mode(path, &rendered, fsio::OWNER_ONLY).map_err(|source| {
        SunError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Returns whether a file was removed.
pub fn remove_auth(path: &Path) -> Result<bool, SunError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(SunError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{load_auth, remove_auth, save_auth, SunAuth, SunCredentials};
    use crate::context::Env;
    use crate::settings::SunSettings;

    #[test]
    fn env_beats_auth_file_which_beats_settings() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let auth_file = dir.path().join("sun/auth.json");
        let settings = SunSettings {
            base_url: Some("https://settings.example".to_string()),
            token: Some("settings-token".to_string()),
            ..SunSettings::default()
        };

        let empty = Env::default();
        let creds = SunCredentials::resolve(&empty, &auth_file, &settings).expect("resolve");
        assert_eq!(creds.base_url.as_deref(), Some("https://settings.example"));
        assert_eq!(creds.token.as_deref(), Some("settings-token"));

        save_auth(
            &auth_file,
            &SunAuth {
                base_url: "https://file.example".to_string(),
                token: "file-token".to_string(),
                ..SunAuth::default()
            },
        )
        .expect("save should work");
        let creds = SunCredentials::resolve(&empty, &auth_file, &settings).expect("resolve");
        assert_eq!(creds.base_url.as_deref(), Some("https://file.example"));
        assert_eq!(creds.token.as_deref(), Some("file-token"));

        let env = Env::from_pairs([
            ("SI_HELIA_BASE_URL", "https://legacy.example"),
            ("SI_SUN_TOKEN", "env-token"),
        ]);
        let creds = SunCredentials::resolve(&env, &auth_file, &settings).expect("resolve");
        assert_eq!(creds.base_url.as_deref(), Some("https://legacy.example"));
        assert_eq!(creds.token.as_deref(), Some("env-token"));
    }

    #[test]
    fn auth_file_is_owner_only_and_removable() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let path = dir.path().join("auth.json");
        assert!(load_auth(&path).expect("missing is fine").is_none());
        save_auth(
            &path,
            &SunAuth {
                base_url: "http://127.0.0.1:9".to_string(),
                token: "t".to_string(),
                ..SunAuth::default()
            },
        )
        .expect("save should work");
        #[cfg(unix)]
        assert_eq!(crate::fsio::mode_of(&path).expect("mode"), 0o600);
        assert!(remove_auth(&path).expect("remove"));
        assert!(!remove_auth(&path).expect("second remove"));
    }
}
