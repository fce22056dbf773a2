use std::time::Duration;

use crate::cli;
use crate::context::{format_rfc3339, CommandContext, SUN_ALLOW_INSECURE_KEYS};
use crate::error::AppError;
use crate::machine::dispatch::{JobFilter, JobRequest, Registration, ServeOptions};
use crate::machine::runner::LocalSi;
use crate::machine::{self, Dispatcher, JobStatus};
use crate::print_json;
use crate::settings::non_empty;
use crate::sun::auth::{self, SunAuth, SunCredentials};
use crate::sun::SunClient;
use crate::taskboard::agent;
use crate::taskboard::engine::split_tags;
use crate::taskboard::{
    AgentIdentity, ClaimRequest, ListFilter, NewTask, Priority, TaskStatus, Taskboard,
};
use crate::ui;

pub(crate) fn run_sun_command(
    args: &cli::SunArgs,
    ctx: &mut CommandContext,
    json: bool,
) -> Result<(), AppError> {
    use cli::SunSubcommands;

    match &args.command {
        SunSubcommands::Auth(auth_args) => run_auth_command(&auth_args.command, ctx, json),
        SunSubcommands::Taskboard(board_args) => {
            run_taskboard_command(&board_args.command, ctx, json)
        }
        SunSubcommands::Machine(machine_args) => {
            run_machine_command(&machine_args.command, ctx, json)
        }
    }
}

fn run_auth_command(
    command: &cli::AuthSubcommands,
    ctx: &CommandContext,
    json: bool,
) -> Result<(), AppError> {
    use cli::AuthSubcommands;

    let auth_file = ctx.paths.sun_auth_file();
    match command {
        AuthSubcommands::Login(login) => {
            let credentials = SunCredentials {
                base_url: Some(login.url.clone()),
                token: Some(login.token.trim().to_string()),
                allow_insecure_http: ctx.env.flag(SUN_ALLOW_INSECURE_KEYS),
            };
            let client = SunClient::new(&credentials)?;
            let whoami = client.whoami()?;
            let saved = SunAuth {
                base_url: client.base_url().to_string(),
                token: login.token.trim().to_string(),
                account_slug: non_empty(Some(whoami.account_slug.as_str())).map(str::to_string),
                saved_at: Some(format_rfc3339(ctx.now())),
            };
            auth::save_auth(&auth_file, &saved)?;
            tracing::debug!(path = %auth_file.display(), "saved sun credentials");
            if json {
                print_json(&serde_json::json!({
                    "base_url": saved.base_url,
                    "account_slug": saved.account_slug,
                    "auth_file": auth_file.display().to_string(),
                }));
            } else {
                println!(
                    "logged in to {} as {}",
                    saved.base_url,
                    saved.account_slug.as_deref().unwrap_or("unknown account")
                );
            }
        }
        AuthSubcommands::Status => {
            let client = crate::sun_client(ctx)?;
            let whoami = client.whoami()?;
            if json {
                print_json(&serde_json::json!({
                    "base_url": client.base_url(),
                    "whoami": whoami,
                }));
            } else {
                println!("base_url: {}", client.base_url());
                println!("account: {}", whoami.account_slug);
                if !whoami.scopes.is_empty() {
                    println!("scopes: {}", whoami.scopes.join(", "));
                }
            }
        }
        AuthSubcommands::Logout => {
            let removed = auth::remove_auth(&auth_file)?;
            if json {
                print_json(&serde_json::json!({ "removed": removed }));
            } else if removed {
                println!("removed {}", auth_file.display());
            } else {
                println!("no saved credentials");
            }
        }
    }
    Ok(())
}

fn run_taskboard_command(
    command: &cli::TaskboardSubcommands,
    ctx: &mut CommandContext,
    json: bool,
) -> Result<(), AppError> {
    use cli::TaskboardSubcommands;

    if let TaskboardSubcommands::Use(use_args) = command {
        let board = non_empty(use_args.board.name.as_deref()).map(str::to_string);
        let agent = non_empty(use_args.agent.as_deref()).map(str::to_string);
        if board.is_none() && agent.is_none() {
            return Err(AppError::InvalidArgument(
                "nothing to save; pass --name and/or --agent".to_string(),
            ));
        }
        if let Some(board) = &board {
            ctx.settings.sun.taskboard = Some(board.clone());
        }
        if let Some(agent) = &agent {
            ctx.settings.sun.taskboard_agent = Some(agent.clone());
        }
        ctx.save_settings()?;
        if json {
            print_json(&serde_json::json!({ "board": board, "agent": agent }));
        } else {
            if let Some(board) = board {
                println!("default board: {board}");
            }
            if let Some(agent) = agent {
                println!("default agent: {agent}");
            }
        }
        return Ok(());
    }

    let client = crate::sun_client(ctx)?;
    let board = Taskboard::new(&client, ctx.clock.as_ref());
    let board_name = |explicit: &Option<String>| {
        agent::board_name(&ctx.env, &ctx.settings, explicit.as_deref())
    };
    let agent_for = |explicit: &Option<String>| {
        AgentIdentity::resolve(&ctx.env, &ctx.settings, explicit.as_deref(), None, None)
    };

    match command {
        TaskboardSubcommands::Use(_) => {}
        TaskboardSubcommands::Show(show) => {
            let view = board.show(&board_name(&show.name))?;
            if json {
                print_json(&view);
            } else {
                ui::print_board(&view);
            }
        }
        TaskboardSubcommands::List(list) => {
            let status = list
                .status
                .as_deref()
                .map(str::parse::<TaskStatus>)
                .transpose()
                .map_err(AppError::InvalidArgument)?;
            let tasks = board.list(
                &board_name(&list.board.name),
                ListFilter {
                    status,
                    owner: list.owner.as_deref(),
                    limit: list.limit,
                },
            )?;
            if json {
                print_json(&tasks);
            } else {
                ui::print_task_table(&tasks);
            }
        }
        TaskboardSubcommands::Add(add) => {
            let name = board_name(&add.board.name);
            let task = board.add(
                &name,
                &NewTask {
                    title: &add.title,
                    prompt: add.prompt.as_deref(),
                    priority: Priority::normalize(&add.priority),
                    tags: add.tags.as_deref().map(split_tags).unwrap_or_default(),
                },
            )?;
            if json {
                print_json(&task);
            } else {
                println!("added {} [{}] {} to {name}", task.id, task.priority, task.title);
            }
        }
        TaskboardSubcommands::Claim(claim) => {
            let identity = agent_for(&claim.agent);
            let name = board_name(&claim.board.name);
            let lease_seconds = agent::lease_seconds(&ctx.env, &ctx.settings, claim.lease_seconds);
            let outcome = match claim.id.as_deref() {
                Some(task_id) => board.claim(
                    &name,
                    ClaimRequest {
                        task_id: Some(task_id),
                        agent: &identity,
                        lease_seconds,
                    },
                )?,
                None => board.autopilot_claim_next(&name, &identity, lease_seconds)?,
            };
            if json {
                print_json(&outcome);
            } else {
                let until = outcome
                    .task
                    .assignment
                    .as_ref()
                    .map(|lock| lock.lease_expires_at.as_str())
                    .unwrap_or("-");
                println!(
                    "claimed {} {} as {} until {until}",
                    outcome.task.id, outcome.task.title, identity.agent_id
                );
            }
        }
        TaskboardSubcommands::Release(release) => {
            let identity = agent_for(&release.agent);
            let task = board.release(&board_name(&release.board.name), &release.id, &identity)?;
            if json {
                print_json(&task);
            } else {
                println!("released {} ({})", task.id, task.status);
            }
        }
        TaskboardSubcommands::Done(done) => {
            let identity = agent_for(&done.task.agent);
            let task = board.done(
                &board_name(&done.task.board.name),
                &done.task.id,
                &identity,
                done.result.as_deref(),
            )?;
            if json {
                print_json(&task);
            } else {
                println!("done {} {}", task.id, task.title);
            }
        }
    }
    Ok(())
}

fn run_machine_command(
    command: &cli::MachineSubcommands,
    ctx: &mut CommandContext,
    json: bool,
) -> Result<(), AppError> {
    use cli::MachineSubcommands;

    let client = crate::sun_client(ctx)?;
    if let MachineSubcommands::Register(register) = command {
        let machine_id =
            machine::resolve_machine_id(&ctx.env, &ctx.settings, register.machine.machine.as_deref());
        let operator_id = machine::resolve_operator_id(
            &ctx.env,
            &ctx.settings,
            register.operator.operator.as_deref(),
            &machine_id,
        );
        let update = Dispatcher::new(&client, ctx.clock.as_ref()).register(&Registration {
            machine_id: &machine_id,
            operator_id: &operator_id,
            display_name: register.display_name.as_deref(),
            allow_operators: register.allow_operators.clone(),
            can_control_others: register.can_control_others,
            can_be_controlled: register.can_be_controlled,
        })?;
        if register.set_defaults {
            ctx.settings.sun.machine_id = Some(update.machine.machine_id.clone());
            ctx.settings.sun.operator_id = Some(operator_id.clone());
            ctx.save_settings()?;
            tracing::debug!(machine = %update.machine.machine_id, "saved machine defaults");
        }
        if json {
            print_json(&update);
        } else {
            println!(
                "registered {} (revision {})",
                update.machine.machine_id, update.revision
            );
            ui::print_machine(&update.machine);
        }
        return Ok(());
    }

    let local_machine = machine::resolve_machine_id(&ctx.env, &ctx.settings, None);
    let operator_for = |explicit: &Option<String>, machine_id: &str| {
        machine::resolve_operator_id(&ctx.env, &ctx.settings, explicit.as_deref(), machine_id)
    };
    let dispatcher = Dispatcher::new(&client, ctx.clock.as_ref());
    match command {
        MachineSubcommands::Register(_) => {}
        MachineSubcommands::Status(status) => {
            let id = machine::resolve_machine_id(&ctx.env, &ctx.settings, status.machine.as_deref());
            let record = dispatcher.status(&id)?;
            if json {
                print_json(&record);
            } else {
                ui::print_machine(&record);
            }
        }
        MachineSubcommands::List(list) => {
            let records = dispatcher.list(list.limit)?;
            if json {
                print_json(&records);
            } else {
                ui::print_machines(&records);
            }
        }
        MachineSubcommands::Allow(grant) => {
            let id = machine::resolve_machine_id(&ctx.env, &ctx.settings, grant.machine.machine.as_deref());
            let caller = operator_for(&grant.operator.operator, &local_machine);
            let update = dispatcher.allow(&id, &grant.grant, &caller)?;
            if json {
                print_json(&update);
            } else {
                println!(
                    "allowed {} on {}: {}",
                    grant.grant.trim(),
                    update.machine.machine_id,
                    update.machine.acl.allowed_operators.join(", ")
                );
            }
        }
        MachineSubcommands::Deny(revoke) => {
            let id = machine::resolve_machine_id(&ctx.env, &ctx.settings, revoke.machine.machine.as_deref());
            let caller = operator_for(&revoke.operator.operator, &local_machine);
            let update = dispatcher.deny(&id, &revoke.revoke, &caller)?;
            if json {
                print_json(&update);
            } else {
                println!(
                    "revoked {} on {}: {}",
                    revoke.revoke.trim(),
                    update.machine.machine_id,
                    update.machine.acl.allowed_operators.join(", ")
                );
            }
        }
        MachineSubcommands::Run(run) => {
            let source =
                machine::resolve_machine_id(&ctx.env, &ctx.settings, run.source_machine.as_deref());
            let operator = operator_for(&run.operator.operator, &source);
            let job = dispatcher.submit(&JobRequest {
                target: &run.machine,
                source: &source,
                operator: &operator,
                command: &run.command,
                timeout_seconds: run.timeout_seconds,
            })?;
            if !run.wait {
                if json {
                    print_json(&job);
                } else {
                    println!("queued {} on {}", job.job_id, job.machine_id);
                }
                return Ok(());
            }
            let finished = dispatcher.wait(
                &job.object_name(),
                Duration::from_secs(run.wait_timeout_seconds),
                Duration::from_secs(run.poll_seconds.max(1)),
            )?;
            if json {
                print_json(&finished.into_result()?);
            } else {
                print!("{}", finished.stdout);
                eprint!("{}", finished.stderr);
                finished.into_result()?;
            }
        }
        MachineSubcommands::Jobs(jobs) => {
            let status = jobs
                .status
                .as_deref()
                .map(str::parse::<JobStatus>)
                .transpose()
                .map_err(AppError::InvalidArgument)?;
            let found = dispatcher.jobs(&JobFilter {
                machine: jobs.machine.as_deref(),
                requested_by: jobs.requested_by.as_deref(),
                status,
                limit: jobs.limit,
            })?;
            if json {
                print_json(&found);
            } else {
                ui::print_jobs(&found);
            }
        }
        MachineSubcommands::Serve(serve) => {
            let id = machine::resolve_machine_id(&ctx.env, &ctx.settings, serve.machine.machine.as_deref());
            let runner = LocalSi::current()?;
            let summary = dispatcher.serve(
                &ServeOptions {
                    machine_id: &id,
                    poll: Duration::from_secs(serve.poll_seconds.max(1)),
                    once: serve.once,
                    max_jobs: serve.max_jobs,
                },
                &runner,
            )?;
            if json {
                print_json(&summary);
            } else {
                println!("processed {} job(s) on {}", summary.processed, summary.machine_id);
            }
        }
    }
    Ok(())
}
