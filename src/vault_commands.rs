use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::Command;

use serde::Serialize;

use crate::cli;
use crate::context::{CommandContext, Env};
use crate::error::AppError;
use crate::guard::{self, hooks, CheckOptions, CheckReport, Finding, GitAdapter, GuardError};
use crate::print_json;
use crate::settings::Settings;
use crate::sun::SunClient;
use crate::ui;
use crate::vault::{self, Backend, PlaintextPolicy, ScopeRequest, VaultEngine};

const DEFAULT_SHELL: &str = "/bin/bash";

pub(crate) fn run_vault_command(
    args: &cli::VaultArgs,
    ctx: &mut CommandContext,
    json: bool,
) -> Result<(), AppError> {
    use cli::VaultSubcommands;

    match &args.command {
        VaultSubcommands::Hooks(hook_args) => return run_hooks_command(&hook_args.command, json),
        VaultSubcommands::Init(init_args) if init_args.set_default => {
            let outcome = {
                let client = store_for(ctx, StoreNeed::Backend)?;
                let engine = VaultEngine::new(ctx, client.as_ref().map(as_store))?;
                engine.init(init_args.scope.request())?
            };
            ctx.settings.vault.scope = Some(outcome.scope.clone());
            ctx.save_settings()?;
            tracing::debug!(scope = %outcome.scope, "saved default vault scope");
            return report_init(&outcome, json);
        }
        _ => {}
    }

    let need = match &args.command {
        VaultSubcommands::History(_) | VaultSubcommands::Backup(_) => StoreNeed::Required,
        VaultSubcommands::Check(check_args) if check_args.staged => StoreNeed::Optional,
        _ => StoreNeed::Backend,
    };
    let client = store_for(ctx, need)?;
    let engine = VaultEngine::new(ctx, client.as_ref().map(as_store))?;

    match &args.command {
        VaultSubcommands::Init(init_args) => {
            let outcome = engine.init(init_args.scope.request())?;
            report_init(&outcome, json)?;
        }
        VaultSubcommands::Set(set_args) => {
            let (scope, key, value) = set_args.parts();
            let outcome = engine.set(set_args.scope.request_with(scope), key, value)?;
            if json {
                print_json(&outcome);
            } else if outcome.changed {
                println!("set {key} in {}", outcome.scope);
            } else {
                println!("{key} unchanged in {}", outcome.scope);
            }
        }
        VaultSubcommands::Get(get_args) => {
            let (scope, key) = get_args.key.parts();
            let outcome = engine.get(get_args.key.scope.request_with(scope), key, get_args.reveal)?;
            if json {
                print_json(&outcome);
            } else {
                println!("{}", outcome.display_value());
            }
        }
        VaultSubcommands::Unset(key_args) => {
            let (scope, key) = key_args.parts();
            let outcome = engine.unset(key_args.scope.request_with(scope), key)?;
            if json {
                print_json(&outcome);
            } else if outcome.changed {
                println!("unset {key} in {}", outcome.scope);
            } else {
                println!("{key} is not set in {}", outcome.scope);
            }
        }
        VaultSubcommands::List(list_args) => {
            let outcome = engine.list(list_args.scope.request())?;
            if json {
                print_json(&outcome);
            } else {
                ui::print_vault_list(&outcome);
            }
        }
        VaultSubcommands::Dump(dump_args) => {
            let outcome = engine.dump(dump_args.scope.request(), dump_args.reveal)?;
            if json {
                print_json(&outcome);
            } else {
                ui::print_dump(&outcome);
            }
        }
        VaultSubcommands::Encrypt(encrypt_args) => {
            let outcome = engine.encrypt(encrypt_args.scope.request(), encrypt_args.format)?;
            if json {
                print_json(&outcome);
            } else if outcome.encrypted_keys.is_empty() {
                println!("nothing to encrypt in {}", outcome.location);
            } else {
                println!(
                    "encrypted {} key(s) in {}: {}",
                    outcome.encrypted_keys.len(),
                    outcome.location,
                    outcome.encrypted_keys.join(", ")
                );
            }
        }
        VaultSubcommands::Check(check_args) => run_check(&engine, &ctx.settings, check_args, json)?,
        VaultSubcommands::Recipients(recipient_args) => {
            run_recipients(&engine, &recipient_args.command, json)?;
        }
        VaultSubcommands::History(history_args) => {
            let outcome = engine.history(history_args.scope.request(), history_args.limit)?;
            if json {
                print_json(&outcome);
            } else if outcome.revisions.is_empty() {
                println!("no revisions for {}", outcome.scope);
            } else {
                for revision in &outcome.revisions {
                    println!(
                        "{}  {}  {} bytes  {}",
                        revision.revision,
                        revision.created_at,
                        revision.size_bytes,
                        revision.checksum
                    );
                }
            }
        }
        VaultSubcommands::Backup(backup_args) => match &backup_args.command {
            cli::BackupSubcommands::Push(push) => {
                let receipt = engine.backup_push(push.scope.request(), push.allow_plaintext)?;
                if json {
                    print_json(&receipt);
                } else {
                    println!(
                        "pushed {} ({} bytes) as revision {}",
                        receipt.scope, receipt.size_bytes, receipt.revision
                    );
                }
            }
            cli::BackupSubcommands::Pull(pull) => {
                let outcome = engine.backup_pull(pull.scope.request(), pull.force)?;
                if json {
                    print_json(&outcome);
                } else {
                    println!(
                        "restored {} from revision {}",
                        outcome.path, outcome.receipt.revision
                    );
                }
            }
        },
        VaultSubcommands::Run(run_args) => run_with_env(&engine, &ctx.env, run_args)?,
        VaultSubcommands::Trust(trust_args) => run_trust(&engine, &trust_args.command, json)?,
        VaultSubcommands::Identity => {
            let (identity, source) = engine.identities().load_or_fail()?;
            if json {
                print_json(&serde_json::json!({
                    "recipient": identity.recipient(),
                    "source": source.to_string(),
                }));
            } else {
                println!("{}", identity.recipient());
                println!("source: {source}");
            }
        }
        VaultSubcommands::Hooks(_) => {}
    }
    Ok(())
}

fn as_store(client: &SunClient) -> &dyn crate::sun::ObjectStore {
    client
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreNeed {
    Required,
    /// Required on the sun backend; optional for local auto-backup.
    Backend,
    /// Staged checks read the git index and never touch the store.
    Optional,
}

fn store_for(ctx: &CommandContext, need: StoreNeed) -> Result<Option<SunClient>, AppError> {
    let backend = vault::resolve_backend(&ctx.env, &ctx.settings)?.backend;
    match need {
        StoreNeed::Required => return crate::sun_client(ctx).map(Some),
        StoreNeed::Backend if backend == Backend::Sun => return crate::sun_client(ctx).map(Some),
        StoreNeed::Optional => return Ok(crate::sun_client(ctx).ok()),
        StoreNeed::Backend if !ctx.settings.sun.auto_sync => return Ok(None),
        StoreNeed::Backend => {}
    }
    match crate::sun_client(ctx) {
        Ok(client) => Ok(Some(client)),
        Err(err) => {
            tracing::warn!(error = %err, "auto-sync is on but sun is not configured");
            Ok(None)
        }
    }
}

fn report_init(outcome: &vault::engine::InitOutcome, json: bool) -> Result<(), AppError> {
    if json {
        print_json(outcome);
        return Ok(());
    }
    println!("initialized {} at {}", outcome.scope, outcome.location);
    println!("recipient: {}", outcome.recipient);
    if let Some(fingerprint) = &outcome.trust_fingerprint {
        println!("trust fp:  {fingerprint}");
    }
    if outcome.identity_created {
        println!("generated identity ({})", outcome.identity_source);
    }
    Ok(())
}

fn run_recipients(
    engine: &VaultEngine<'_>,
    command: &cli::RecipientsSubcommands,
    json: bool,
) -> Result<(), AppError> {
    use cli::RecipientsSubcommands;

    let (outcome, verb, recipient) = match command {
        RecipientsSubcommands::List(list_args) => {
            let outcome = engine.recipients_list(list_args.scope.request())?;
            if json {
                print_json(&outcome);
            } else {
                for recipient in &outcome.recipients {
                    println!("{recipient}");
                }
                println!("fingerprint: {}", outcome.fingerprint);
            }
            return Ok(());
        }
        RecipientsSubcommands::Add(add) => (
            engine.recipients_add(add.scope.request(), &add.recipient)?,
            "added",
            &add.recipient,
        ),
        RecipientsSubcommands::Remove(remove) => (
            engine.recipients_remove(remove.scope.request(), &remove.recipient)?,
            "removed",
            &remove.recipient,
        ),
    };
    if json {
        print_json(&outcome);
    } else if outcome.changed {
        println!("{verb} {} in {}", recipient.trim(), outcome.scope);
    } else {
        println!("recipients unchanged in {}", outcome.scope);
    }
    Ok(())
}

/// The child inherits stdio and this process's environment plus the scope's
/// values; a non-zero child exit becomes si's exit code.
fn run_with_env(
    engine: &VaultEngine<'_>,
    env: &Env,
    args: &cli::VaultRunArgs,
) -> Result<(), AppError> {
    let Some((program, rest)) = args.command.split_first() else {
        return Err(AppError::InvalidArgument("vault run needs a command".to_string()));
    };
    let scope_env = engine.run_env(args.scope.request(), args.allow_plaintext)?;
    let mut command = if args.shell {
        let shell = args
            .shell_path
            .clone()
            .or_else(|| env.get("SHELL").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL));
        let mode = if args.shell_interactive { "-ic" } else { "-lc" };
        let mut command = Command::new(shell);
        command.arg(mode).arg(args.command.join(" "));
        command
    } else {
        let mut command = Command::new(program);
        command.args(rest);
        command
    };
    command.envs(scope_env.values.iter().map(|(key, value)| (key, value)));
    tracing::debug!(
        scope = %scope_env.scope,
        program = %program,
        keys = scope_env.values.len(),
        shell = args.shell,
        "running with vault environment"
    );
    let status = command.status()?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

fn run_trust(
    engine: &VaultEngine<'_>,
    command: &cli::TrustSubcommands,
    json: bool,
) -> Result<(), AppError> {
    use cli::TrustSubcommands;

    let outcome = match command {
        TrustSubcommands::Status(status) => engine.trust_status(status.scope.request())?,
        TrustSubcommands::Accept(accept) => {
            if !accept.yes {
                let current = engine.trust_status(accept.scope.request())?;
                let prompt = format!(
                    "Accept vault trust for {} with fingerprint {}? [y/N]: ",
                    current.location,
                    current.current_fingerprint.as_deref().unwrap_or("(unavailable)")
                );
                if !confirm(&prompt)? {
                    return Ok(());
                }
            }
            engine.trust_accept(accept.scope.request())?
        }
        TrustSubcommands::Forget(forget) => engine.trust_forget(forget.scope.request())?,
    };
    if json {
        print_json(&outcome);
        return Ok(());
    }
    match command {
        TrustSubcommands::Status(_) => {
            println!("location:   {}", outcome.location);
            println!(
                "current fp: {}",
                outcome.current_fingerprint.as_deref().unwrap_or("(unavailable)")
            );
            println!(
                "stored fp:  {}",
                outcome.stored_fingerprint.as_deref().unwrap_or("(none)")
            );
            println!("trust:      {}", outcome.state.as_str());
        }
        TrustSubcommands::Accept(_) => println!("trusted: {}", outcome.location),
        TrustSubcommands::Forget(_) if outcome.changed => {
            println!("trust: removed for {}", outcome.location)
        }
        TrustSubcommands::Forget(_) => println!("trust: no entry for {}", outcome.location),
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool, AppError> {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return Err(AppError::InvalidArgument(
            "non-interactive: pass --yes to accept vault trust".to_string(),
        ));
    }
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Files are scanned by the guard; a sun-backed scope is scanned in place.
fn run_check(
    engine: &VaultEngine<'_>,
    settings: &Settings,
    args: &cli::VaultCheckArgs,
    json: bool,
) -> Result<(), AppError> {
    let policy = PlaintextPolicy::resolve(settings)?;
    if policy == PlaintextPolicy::Off {
        tracing::debug!("plaintext policy is off; skipping check");
        if json {
            print_json(&CheckReport::default());
        }
        return Ok(());
    }

    let request = args.scope.request();
    let report = if args.staged
        || request.file.is_some()
        || engine.backend().backend == Backend::Local
    {
        scan_files(engine, args, request)?
    } else {
        let (target, keys) = engine.plaintext_scan(request)?;
        let location = target.location.to_string();
        let mut report = CheckReport {
            scanned: vec![location.clone()],
            ..CheckReport::default()
        };
        if !keys.is_empty() {
            report
                .findings
                .push(Finding::for_scope(location, &target.scope, keys));
        }
        report
    };

    if report.is_clean() {
        if json {
            print_json(&report);
        }
        return Ok(());
    }
    eprint!("{}", report.render());
    match policy {
        PlaintextPolicy::Warn => {
            tracing::warn!(files = report.findings.len(), "plaintext values detected");
            if json {
                print_json(&report);
            }
            Ok(())
        }
        // The report rides on the error; main prints it inside the one
        // failure document.
        _ => Err(GuardError::PlaintextDetected(Box::new(report)).into()),
    }
}

fn scan_files(
    engine: &VaultEngine<'_>,
    args: &cli::VaultCheckArgs,
    request: ScopeRequest<'_>,
) -> Result<CheckReport, AppError> {
    let target = match engine.target(request) {
        Ok(target) => Some(target),
        // `--staged --all` does not need a resolvable scope.
        Err(err) if args.staged && args.all => {
            tracing::debug!(error = %err, "no scope target; scanning every staged file");
            None
        }
        Err(err) => return Err(err.into()),
    };
    let options = CheckOptions {
        target: target.as_ref().and_then(|target| target.file_path()),
        staged: args.staged,
        all: args.all,
        include_examples: args.include_examples,
        ..CheckOptions::new(&args.vault_dir)
    };
    Ok(guard::check(&GitAdapter::new(), &options)?)
}

#[derive(Debug, Serialize)]
struct HookOutput<'a> {
    path: String,
    state: &'a str,
    changed: bool,
}

fn run_hooks_command(command: &cli::HooksSubcommands, json: bool) -> Result<(), AppError> {
    use cli::HooksSubcommands;

    let git = GitAdapter::new();
    let (report, verb) = match command {
        HooksSubcommands::Install(install) => {
            let si_bin = match &install.si_bin {
                Some(path) => path.clone(),
                None => std::env::current_exe()?,
            };
            let report = hooks::install(&git, &install.dir.vault_dir, &si_bin, install.force)?;
            (report, "installed")
        }
        HooksSubcommands::Status(dir) => (hooks::status(&git, &dir.vault_dir)?, "status"),
        HooksSubcommands::Uninstall(dir) => (hooks::uninstall(&git, &dir.vault_dir)?, "removed"),
    };
    if json {
        print_json(&HookOutput {
            path: report.path.display().to_string(),
            state: report.state.as_str(),
            changed: report.changed,
        });
    } else if verb == "status" {
        println!("{} {}", report.state.as_str(), report.path.display());
    } else if report.changed {
        println!("{verb} pre-commit hook at {}", report.path.display());
    } else {
        println!("pre-commit hook already {} at {}", report.state.as_str(), report.path.display());
    }
    Ok(())
}
