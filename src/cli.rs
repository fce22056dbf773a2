use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Args, CommandFactory, Parser, Subcommand};

pub use crate::cli_ops::*;

fn cli_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::BrightYellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightGreen.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::BrightMagenta.on_default())
}

pub fn styled_command() -> clap::Command {
    Cli::command()
}

#[derive(Debug, Parser)]
#[command(name = "si")]
#[command(bin_name = "si")]
#[command(version)]
#[command(about = "Encrypted dotenv vault, shared taskboards and remote jobs over Sun")]
#[command(styles = cli_styles())]
pub struct Cli {
    #[arg(
        short = 'j',
        long,
        global = true,
        help = "Render machine-readable JSON on stdout."
    )]
    pub json: bool,

    #[arg(
        short = 'v',
        long,
        global = true,
        help = "Log debug events to stderr (SI_LOG overrides)."
    )]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Manage encrypted dotenv scopes.")]
    Vault(VaultArgs),
    #[command(about = "Sun account, taskboards and machines.")]
    Sun(SunArgs),
    #[command(about = "Generate or install shell completions.")]
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
#[command(about = "Generate or install shell completions.")]
pub struct CompletionsArgs {
    #[arg(help = "Shell name (bash, zsh, fish). Auto-detected if omitted.")]
    pub shell: Option<String>,

    #[arg(
        short = 'i',
        long = "install",
        help = "Write completions to the canonical path for the shell."
    )]
    pub install: bool,
}

#[derive(Debug, Args)]
pub struct VaultArgs {
    #[command(subcommand)]
    pub command: VaultSubcommands,
}

#[derive(Debug, Subcommand)]
#[allow(clippy::large_enum_variant)]
pub enum VaultSubcommands {
    #[command(about = "Create a scope and the local identity if missing.")]
    Init(VaultInitArgs),
    #[command(about = "Encrypt and store a value.")]
    Set(VaultSetArgs),
    #[command(about = "Read a value; encrypted values need --reveal.")]
    Get(VaultGetArgs),
    #[command(about = "Tombstone a key with an empty value.")]
    Unset(VaultKeyArgs),
    #[command(about = "List keys and whether they are encrypted.")]
    List(VaultScopeOnlyArgs),
    #[command(about = "Print every key, optionally decrypted.")]
    Dump(VaultDumpArgs),
    #[command(about = "Encrypt every plaintext value in place.")]
    Encrypt(VaultEncryptArgs),
    #[command(about = "Fail when dotenv files contain plaintext values.")]
    Check(VaultCheckArgs),
    #[command(about = "Inspect or edit the scope's recipients.")]
    Recipients(RecipientsArgs),
    #[command(about = "List stored revisions of a scope (sun backend).")]
    History(VaultHistoryArgs),
    #[command(about = "Copy a local scope file to or from Sun.")]
    Backup(BackupArgs),
    #[command(about = "Run a command with the scope's decrypted values in its environment.")]
    Run(VaultRunArgs),
    #[command(about = "Inspect, pin or forget the trusted recipient set of a local scope.")]
    Trust(TrustArgs),
    #[command(about = "Show the local age recipient and where it was loaded from.")]
    Identity,
    #[command(about = "Manage the git pre-commit hook that runs `vault check --staged`.")]
    Hooks(HooksArgs),
}

#[derive(Debug, Args)]
pub struct SunArgs {
    #[command(subcommand)]
    pub command: SunSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum SunSubcommands {
    #[command(about = "Store, check or remove Sun credentials.")]
    Auth(AuthArgs),
    #[command(about = "Shared task queue for agents.")]
    Taskboard(TaskboardArgs),
    #[command(about = "Register machines and dispatch remote si jobs.")]
    Machine(MachineArgs),
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
