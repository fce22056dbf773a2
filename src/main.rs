mod cli;
mod cli_ops;
mod completions;
mod context;
mod dotenv;
mod error;
mod fsio;
mod guard;
mod identity;
mod ids;
mod machine;
mod settings;
mod sun;
mod sun_commands;
mod taskboard;
mod ui;
mod vault;
mod vault_commands;

use std::io::IsTerminal;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::context::{CommandContext, Env};
use crate::error::AppError;
use crate::sun::auth::SunCredentials;
use crate::sun::SunClient;

const LOG_FILTER_KEY: &str = "SI_LOG";

fn main() {
    let cli = cli::Cli::parse();
    init_logging(cli.verbose);
    let json = cli.json;
    if let Err(err) = run(cli) {
        let kind = err.kind();
        if json {
            let mut payload = serde_json::json!({
                "ok": false,
                "error": err.to_string(),
                "kind": kind.as_str(),
            });
            if let Some((field, details)) = err.details() {
                payload[field] = details;
            }
            println!("{payload}");
        } else {
            eprintln!("error: {}", err);
        }
        std::process::exit(kind.exit_code());
    }
}

/// Events go to stderr; stdout carries command output only.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = std::env::var(LOG_FILTER_KEY)
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .try_init();
}

pub(crate) fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => eprintln!("error: json serialization failed: {err}"),
    }
}

/// Builds an HTTP store from env, saved auth and settings.
pub(crate) fn sun_client(ctx: &CommandContext) -> Result<SunClient, AppError> {
    let credentials =
        SunCredentials::resolve(&ctx.env, &ctx.paths.sun_auth_file(), &ctx.settings.sun)?;
    Ok(SunClient::new(&credentials)?)
}

fn run(cli: cli::Cli) -> Result<(), AppError> {
    use cli::Commands;

    match &cli.command {
        Commands::Completions(args) => completions::run_completions_command(args),
        Commands::Vault(args) => {
            let mut ctx = CommandContext::load(Env::capture())?;
            vault_commands::run_vault_command(args, &mut ctx, cli.json)
        }
        Commands::Sun(args) => {
            let mut ctx = CommandContext::load(Env::capture())?;
            sun_commands::run_sun_command(args, &mut ctx, cli.json)
        }
    }
}
