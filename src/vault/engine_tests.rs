use std::path::{Path, PathBuf};

use super::VaultEngine;
use crate::context::{CommandContext, Env, FixedClock, StatePaths};
use crate::identity::Identity;
use crate::settings::Settings;
use crate::sun::memory::MemoryStore;
use crate::sun::{KIND_DOTENV_SCOPE, KIND_VAULT_BACKUP};
use crate::vault::trust::TrustState;
use crate::vault::{ScopeRequest, VaultError};

fn context(home: &Path, pairs: &[(&str, &str)]) -> CommandContext {
    CommandContext {
        env: Env::from_pairs(pairs.iter().copied()),
        paths: StatePaths::under(home.to_path_buf()),
        settings: Settings::default(),
        clock: Box::new(FixedClock::at("2026-03-01T12:00:00Z")),
    }
}

fn scope(name: &str) -> ScopeRequest<'_> {
    ScopeRequest {
        scope: Some(name),
        file: None,
    }
}

fn scope_file(home: &Path, name: &str) -> PathBuf {
    home.join(".si/vault").join(format!(".env.{name}"))
}

#[test]
fn set_then_reveal_round_trips_and_hides_by_default() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");

    let init = engine.init(scope("alpha")).expect("init");
    assert!(init.identity_created);
    engine.set(scope("alpha"), "FOO", "bar baz").expect("set");

    let hidden = engine.get(scope("alpha"), "FOO", false).expect("get");
    assert!(hidden.encrypted);
    assert_eq!(hidden.value, None);
    assert_eq!(hidden.display_value(), "(encrypted; use --reveal)");

    let revealed = engine.get(scope("alpha"), "FOO", true).expect("reveal");
    assert_eq!(revealed.value.as_deref(), Some("bar baz"));

    let raw = std::fs::read_to_string(scope_file(home.path(), "alpha")).expect("scope file");
    assert!(raw.starts_with("# si-vault:v2\n# si-vault:recipient age1"));
    assert!(raw.contains("\nFOO=age:v1:"));
    assert!(!raw.contains("bar baz"));

    #[cfg(unix)]
    assert_eq!(
        crate::fsio::mode_of(&scope_file(home.path(), "alpha")).expect("mode"),
        0o600
    );
}

#[test]
fn init_twice_reports_scope_exists_without_touching_the_file() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.init(scope("alpha")).expect("first init");
    let before = std::fs::read(scope_file(home.path(), "alpha")).expect("read");

    let err = engine.init(scope("alpha")).expect_err("second init");
    assert!(matches!(err, VaultError::ScopeExists(_)));
    let after = std::fs::read(scope_file(home.path(), "alpha")).expect("read");
    assert_eq!(before, after);
}

#[test]
fn setting_the_same_value_twice_rewrites_ciphertext_but_keeps_value() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.init(scope("alpha")).expect("init");

    engine.set(scope("alpha"), "TOKEN", "v").expect("first set");
    let first = std::fs::read_to_string(scope_file(home.path(), "alpha")).expect("read");
    let outcome = engine.set(scope("alpha"), "TOKEN", "v").expect("second set");
    let second = std::fs::read_to_string(scope_file(home.path(), "alpha")).expect("read");

    assert!(outcome.changed);
    assert_ne!(first, second);
    let revealed = engine.get(scope("alpha"), "TOKEN", true).expect("reveal");
    assert_eq!(revealed.value.as_deref(), Some("v"));
}

#[test]
fn a_foreign_identity_is_not_a_recipient() {
    let owner_home = tempfile::tempdir().expect("tempdir should be creatable");
    let owner_ctx = context(owner_home.path(), &[]);
    let owner = VaultEngine::new(&owner_ctx, None).expect("engine");
    owner.init(scope("alpha")).expect("init");
    owner.set(scope("alpha"), "FOO", "secret").expect("set");

    let other_home = tempfile::tempdir().expect("tempdir should be creatable");
    let other_ctx = context(other_home.path(), &[]);
    let other = VaultEngine::new(&other_ctx, None).expect("engine");
    other.init(scope("alpha")).expect("init");
    std::fs::copy(
        scope_file(owner_home.path(), "alpha"),
        scope_file(other_home.path(), "alpha"),
    )
    .expect("copy scope");

    let err = other.get(scope("alpha"), "FOO", true).expect_err("swapped header");
    assert!(matches!(err, VaultError::TrustMismatch(_)));
    other.trust_accept(scope("alpha")).expect("accept");
    let err = other.get(scope("alpha"), "FOO", true).expect_err("foreign");
    assert_eq!(err.kind(), crate::error::ErrKind::NotARecipient);
    assert!(other.get(scope("alpha"), "FOO", false).is_ok());
}

#[test]
fn plaintext_values_stay_hidden_without_reveal() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.init(scope("alpha")).expect("init");
    let path = scope_file(home.path(), "alpha");
    let mut raw = std::fs::read_to_string(&path).expect("read");
    raw.push_str("PLAIN=hunter2\n");
    std::fs::write(&path, raw).expect("inject plaintext");

    let hidden = engine.get(scope("alpha"), "PLAIN", false).expect("get");
    assert!(!hidden.encrypted);
    assert_eq!(hidden.value, None);
    assert!(hidden.display_value().starts_with("(plaintext; run `si vault encrypt`"));
    assert!(!serde_json::to_string(&hidden).expect("json").contains("hunter2"));

    let revealed = engine.get(scope("alpha"), "PLAIN", true).expect("reveal");
    assert_eq!(revealed.value.as_deref(), Some("hunter2"));
    assert!(engine
        .dump(scope("alpha"), false)
        .expect("dump")
        .entries
        .iter()
        .all(|entry| entry.value.is_none()));
}

#[test]
fn unset_tombstones_and_hides_the_key() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.init(scope("alpha")).expect("init");
    engine.set(scope("alpha"), "FOO", "x").expect("set");

    assert!(engine.unset(scope("alpha"), "FOO").expect("unset").changed);
    assert!(!engine.unset(scope("alpha"), "FOO").expect("unset again").changed);
    assert!(!engine.unset(scope("alpha"), "NEVER").expect("absent").changed);

    let raw = std::fs::read_to_string(scope_file(home.path(), "alpha")).expect("read");
    assert!(raw.contains("\nFOO=\n"));
    assert!(engine.list(scope("alpha")).expect("list").entries.is_empty());
    assert!(matches!(
        engine.get(scope("alpha"), "FOO", false),
        Err(VaultError::KeyNotFound { .. })
    ));
}

#[test]
fn list_keeps_file_order_and_skips_the_public_key_entry() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.identities().ensure().expect("identity");
    let path = scope_file(home.path(), "alpha");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, "SI_VAULT_PUBLIC_KEY=age1abc\nPLAIN=oops\n").expect("seed");

    engine.set(scope("alpha"), "SEC", "hidden").expect("set");
    let listed = engine.list(scope("alpha")).expect("list");
    let keys = listed
        .entries
        .iter()
        .map(|entry| (entry.key.as_str(), entry.encrypted))
        .collect::<Vec<_>>();
    assert_eq!(keys, vec![("PLAIN", false), ("SEC", true)]);

    let dumped = engine.dump(scope("alpha"), true).expect("dump");
    let values = dumped
        .entries
        .iter()
        .map(|entry| entry.value.as_deref())
        .collect::<Vec<_>>();
    assert_eq!(values, vec![Some("oops"), Some("hidden")]);
    assert!(engine
        .dump(scope("alpha"), false)
        .expect("dump")
        .entries
        .iter()
        .all(|entry| entry.value.is_none()));
}

#[test]
fn reads_of_a_missing_scope_are_not_found() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    assert!(matches!(
        engine.list(scope("ghost")),
        Err(VaultError::ScopeNotFound(_))
    ));
    assert!(matches!(
        engine.get(scope("ghost"), "FOO", false),
        Err(VaultError::ScopeNotFound(_))
    ));
    assert!(matches!(
        engine.set(scope("bad/slug"), "FOO", "x"),
        Err(VaultError::InvalidScope(_))
    ));
}

#[test]
fn recipient_changes_protect_the_local_identity_and_the_last_reader() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    let init = engine.init(scope("alpha")).expect("init");
    let teammate = Identity::generate().recipient().to_string();

    assert!(engine.recipients_add(scope("alpha"), &teammate).expect("add").changed);
    assert!(!engine.recipients_add(scope("alpha"), &teammate).expect("re-add").changed);
    let listed = engine.recipients_list(scope("alpha")).expect("list");
    assert_eq!(listed.recipients, vec![init.recipient.clone(), teammate.clone()]);
    assert_eq!(listed.fingerprint.len(), 64);

    assert!(matches!(
        engine.recipients_remove(scope("alpha"), &init.recipient),
        Err(VaultError::OwnRecipient(_))
    ));
    assert!(matches!(
        engine.recipients_add(scope("alpha"), "age1nope"),
        Err(VaultError::Identity(_))
    ));
    assert!(engine.recipients_remove(scope("alpha"), &teammate).expect("remove").changed);

    let path = scope_file(home.path(), "beta");
    std::fs::write(
        &path,
        format!("# si-vault:v2\n# si-vault:recipient {teammate}\n\nA=age:v1:QUJD\n"),
    )
    .expect("seed");
    assert!(matches!(
        engine.recipients_remove(scope("beta"), &teammate),
        Err(VaultError::LastRecipient(_))
    ));
}

#[test]
fn encrypt_seals_plaintext_values_in_place() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let workdir = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.identities().ensure().expect("identity");
    let file = workdir.path().join(".env");
    std::fs::write(&file, "# app config\nPLAIN=oops\nEMPTY=\n").expect("seed");
    let request = ScopeRequest {
        scope: None,
        file: Some(file.as_path()),
    };

    let outcome = engine.encrypt(request, true).expect("encrypt");
    assert_eq!(outcome.scope, "default");
    assert_eq!(outcome.encrypted_keys, vec!["PLAIN".to_string()]);
    assert!(outcome.header_changed);
    let raw = std::fs::read_to_string(&file).expect("read");
    assert!(raw.starts_with("# si-vault:v2\n"));
    assert!(raw.contains("# app config\n"));
    assert!(raw.contains("\nEMPTY=\n"));
    assert_eq!(
        engine.get(request, "PLAIN", true).expect("reveal").value.as_deref(),
        Some("oops")
    );

    let again = engine.encrypt(request, true).expect("second encrypt");
    assert!(!again.changed);
    assert!(again.encrypted_keys.is_empty());
}

#[test]
fn sun_backend_writes_through_cas_and_reports_history() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[("SI_VAULT_SYNC_BACKEND", "sun")]);
    let store = MemoryStore::new();
    let engine = VaultEngine::new(&ctx, Some(&store)).expect("engine");

    assert_eq!(engine.init(scope("alpha")).expect("init").revision, Some(1));
    store.inject_conflicts(2);
    assert_eq!(
        engine.set(scope("alpha"), "FOO", "bar").expect("set").revision,
        Some(2)
    );
    assert_eq!(
        engine.set(scope("alpha"), "FOO", "bar").expect("set").revision,
        Some(3)
    );
    assert!(matches!(
        engine.init(scope("alpha")),
        Err(VaultError::ScopeExists(_))
    ));
    assert_eq!(store.latest_revision(KIND_DOTENV_SCOPE, "kv/alpha"), 3);
    assert!(!home.path().join(".si/vault/.env.alpha").exists());

    let revealed = engine.get(scope("alpha"), "FOO", true).expect("reveal");
    assert_eq!(revealed.value.as_deref(), Some("bar"));
    let (target, plaintext) = engine.plaintext_scan(scope("alpha")).expect("scan");
    assert_eq!(target.scope, "alpha");
    assert!(plaintext.is_empty());

    let history = engine.history(scope("alpha"), 10).expect("history");
    let revisions = history
        .revisions
        .iter()
        .map(|revision| revision.revision)
        .collect::<Vec<_>>();
    assert_eq!(revisions, vec![3, 2, 1]);
    assert_eq!(history.revisions[0].metadata["scope"], "alpha");
}

#[test]
fn sun_backend_without_a_store_is_not_authenticated() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[("SI_VAULT_SYNC_BACKEND", "sun")]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    let err = engine.list(scope("alpha")).expect_err("no store");
    assert_eq!(err.kind(), crate::error::ErrKind::NotAuthenticated);
}

#[test]
fn history_is_unsupported_on_the_local_backend() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    assert!(matches!(
        engine.history(scope("alpha"), 5),
        Err(VaultError::Unsupported(_))
    ));
}

#[test]
fn mutations_are_audited_without_values() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let log = home.path().join("audit.jsonl");
    let log_value = log.to_string_lossy().to_string();
    let ctx = context(home.path(), &[("SI_VAULT_AUDIT_LOG", log_value.as_str())]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.init(scope("alpha")).expect("init");
    engine.set(scope("alpha"), "FOO", "topsecret").expect("set");
    engine.unset(scope("alpha"), "NEVER").expect("no-op unset");

    let raw = std::fs::read_to_string(&log).expect("audit log");
    let actions = raw
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("json");
            value["action"].as_str().unwrap_or_default().to_string()
        })
        .collect::<Vec<_>>();
    assert_eq!(actions, vec!["init", "set"]);
    assert!(!raw.contains("topsecret"));
    assert!(raw.contains("2026-03-01T12:00:00Z"));
}

#[test]
fn reveals_and_runs_are_audited_without_values() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let log = home.path().join("audit.jsonl");
    let log_value = log.to_string_lossy().to_string();
    let ctx = context(home.path(), &[("SI_VAULT_AUDIT_LOG", log_value.as_str())]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.init(scope("alpha")).expect("init");
    engine.set(scope("alpha"), "FOO", "topsecret").expect("set");
    engine.get(scope("alpha"), "FOO", false).expect("hidden get");
    engine.get(scope("alpha"), "FOO", true).expect("reveal");
    engine.dump(scope("alpha"), true).expect("dump");
    engine.run_env(scope("alpha"), false).expect("run env");

    let raw = std::fs::read_to_string(&log).expect("audit log");
    let records = raw
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json"))
        .collect::<Vec<_>>();
    let actions = records
        .iter()
        .map(|record| record["action"].as_str().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(actions, vec!["init", "set", "reveal", "reveal", "run"]);
    assert_eq!(records[2]["key"], "FOO");
    assert!(records[3].get("key").is_none());
    assert!(!raw.contains("topsecret"));
}

#[test]
fn init_pins_trust_and_a_swapped_header_blocks_reveals_and_writes() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    let init = engine.init(scope("alpha")).expect("init");
    let pinned = init.trust_fingerprint.clone().expect("local init pins trust");
    engine.set(scope("alpha"), "FOO", "bar").expect("set");

    let status = engine.trust_status(scope("alpha")).expect("status");
    assert_eq!(status.state, TrustState::Ok);
    assert_eq!(status.stored_fingerprint.as_deref(), Some(pinned.as_str()));

    let intruder = Identity::generate().recipient().to_string();
    let path = scope_file(home.path(), "alpha");
    let raw = std::fs::read_to_string(&path).expect("read");
    let swapped = raw.replace(&init.recipient, &intruder);
    std::fs::write(&path, swapped).expect("swap header");

    assert_eq!(
        engine.trust_status(scope("alpha")).expect("status").state,
        TrustState::Mismatch
    );
    for err in [
        engine.get(scope("alpha"), "FOO", true).expect_err("reveal"),
        engine.dump(scope("alpha"), true).expect_err("dump"),
        engine.set(scope("alpha"), "NEW", "value").expect_err("set"),
        engine.run_env(scope("alpha"), false).expect_err("run"),
    ] {
        assert_eq!(err.kind(), crate::error::ErrKind::Untrusted, "{err}");
    }
    assert!(engine.get(scope("alpha"), "FOO", false).is_ok());
    assert!(!std::fs::read_to_string(&path).expect("read").contains("NEW="));

    let accepted = engine.trust_accept(scope("alpha")).expect("accept");
    assert!(accepted.changed);
    assert_ne!(accepted.current_fingerprint.as_deref(), Some(pinned.as_str()));
    engine.set(scope("alpha"), "NEW", "value").expect("set after accept");

    let forgotten = engine.trust_forget(scope("alpha")).expect("forget");
    assert!(forgotten.changed);
    assert!(!engine.trust_forget(scope("alpha")).expect("forget again").changed);
    assert!(matches!(
        engine.get(scope("alpha"), "NEW", true),
        Err(VaultError::TrustNotEstablished(_))
    ));
}

#[test]
fn recipient_changes_repin_trust_and_missing_files_are_unavailable() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let store_path = home.path().join("pins/trust.json");
    let store_value = store_path.to_string_lossy().to_string();
    let ctx = context(home.path(), &[("SI_VAULT_TRUST_STORE", store_value.as_str())]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");

    assert_eq!(
        engine.trust_status(scope("alpha")).expect("status").state,
        TrustState::Unavailable
    );
    engine.init(scope("alpha")).expect("init");
    assert!(store_path.exists());
    let teammate = Identity::generate().recipient().to_string();
    engine.recipients_add(scope("alpha"), &teammate).expect("add");

    let status = engine.trust_status(scope("alpha")).expect("status");
    assert_eq!(status.state, TrustState::Ok);
    let listed = engine.recipients_list(scope("alpha")).expect("list");
    assert_eq!(status.current_fingerprint, Some(listed.fingerprint));
}

#[test]
fn run_env_decrypts_values_and_refuses_plaintext_by_default() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.init(scope("alpha")).expect("init");
    engine.set(scope("alpha"), "DB_URL", "postgres://db").expect("set");
    engine.set(scope("alpha"), "TOKEN", "t0k").expect("set");
    engine.unset(scope("alpha"), "TOKEN").expect("unset");

    let env = engine.run_env(scope("alpha"), false).expect("run env");
    assert_eq!(
        env.values,
        vec![("DB_URL".to_string(), "postgres://db".to_string())]
    );
    assert!(env.plaintext_keys.is_empty());

    let path = scope_file(home.path(), "alpha");
    let mut raw = std::fs::read_to_string(&path).expect("read");
    raw.push_str("PLAIN=oops\n");
    std::fs::write(&path, raw).expect("inject plaintext");
    assert!(matches!(
        engine.run_env(scope("alpha"), false),
        Err(VaultError::PlaintextRefused(_))
    ));
    let env = engine.run_env(scope("alpha"), true).expect("allowed");
    assert_eq!(env.plaintext_keys, vec!["PLAIN".to_string()]);
    assert!(env
        .values
        .contains(&("PLAIN".to_string(), "oops".to_string())));
}

#[test]
fn local_writes_back_up_sealed_scopes_when_auto_sync_is_on() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let mut ctx = context(home.path(), &[]);
    ctx.settings.sun.auto_sync = true;
    let store = MemoryStore::new();
    let engine = VaultEngine::new(&ctx, Some(&store)).expect("engine");

    engine.init(scope("alpha")).expect("init");
    engine.set(scope("alpha"), "FOO", "bar").expect("set");
    assert_eq!(store.latest_revision(KIND_VAULT_BACKUP, "alpha"), 2);

    let path = scope_file(home.path(), "alpha");
    let mut raw = std::fs::read_to_string(&path).expect("read");
    raw.push_str("PLAIN=oops\n");
    std::fs::write(&path, raw).expect("inject plaintext");
    engine.set(scope("alpha"), "OTHER", "x").expect("set with plaintext present");
    assert_eq!(store.latest_revision(KIND_VAULT_BACKUP, "alpha"), 2);
}

#[test]
fn backup_pull_restores_the_exact_bytes() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let ctx = context(home.path(), &[]);
    let store = MemoryStore::new();
    let engine = VaultEngine::new(&ctx, Some(&store)).expect("engine");
    engine.init(scope("alpha")).expect("init");
    engine.set(scope("alpha"), "FOO", "bar").expect("set");
    let path = scope_file(home.path(), "alpha");
    let original = std::fs::read(&path).expect("read");

    engine.backup_push(scope("alpha"), false).expect("push");
    assert!(matches!(
        engine.backup_pull(scope("alpha"), false),
        Err(VaultError::BackupTargetExists(_))
    ));
    std::fs::remove_file(&path).expect("delete local");
    let pulled = engine.backup_pull(scope("alpha"), false).expect("pull");
    assert_eq!(pulled.receipt.size_bytes, original.len());
    assert_eq!(std::fs::read(&path).expect("read"), original);
}

#[cfg(unix)]
#[test]
fn symlinked_scope_files_are_refused_unless_allowed() {
    let home = tempfile::tempdir().expect("tempdir should be creatable");
    let real = home.path().join("real.env");
    std::fs::write(&real, "").expect("seed");
    let link = scope_file(home.path(), "alpha");
    std::fs::create_dir_all(link.parent().expect("parent")).expect("mkdir");
    std::os::unix::fs::symlink(&real, &link).expect("symlink");

    let ctx = context(home.path(), &[]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.identities().ensure().expect("identity");
    assert!(matches!(
        engine.set(scope("alpha"), "FOO", "bar"),
        Err(VaultError::SymlinkRefused(_))
    ));

    let ctx = context(home.path(), &[("SI_VAULT_ALLOW_SYMLINK_ENV_FILE", "1")]);
    let engine = VaultEngine::new(&ctx, None).expect("engine");
    engine.set(scope("alpha"), "FOO", "bar").expect("set through link");
    assert!(crate::fsio::is_symlink(&link));
    assert!(std::fs::read_to_string(&real)
        .expect("read")
        .contains("FOO=age:v1:"));
}
