use std::path::PathBuf;

use clap::{ArgAction, Args, Subcommand};

use crate::vault::ScopeRequest;

#[derive(Debug, Clone, Default, Args)]
pub struct ScopeArgs {
    #[arg(short = 's', long, help = "Scope slug (defaults to vault.scope, then `default`).")]
    pub scope: Option<String>,

    #[arg(short = 'f', long, help = "Dotenv file to use instead of a scope (local backend).")]
    pub file: Option<PathBuf>,
}

impl ScopeArgs {
    pub fn request(&self) -> ScopeRequest<'_> {
        self.request_with(None)
    }

    /// A leading positional scope wins over `--scope`.
    pub fn request_with<'a>(&'a self, positional: Option<&'a str>) -> ScopeRequest<'a> {
        ScopeRequest {
            scope: positional.or(self.scope.as_deref()),
            file: self.file.as_deref(),
        }
    }
}

#[derive(Debug, Args)]
#[command(about = "Create a scope.")]
pub struct VaultInitArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, help = "Persist the scope as vault.scope in settings.")]
    pub set_default: bool,
}

#[derive(Debug, Args)]
#[command(about = "Encrypt and store a value.")]
pub struct VaultSetArgs {
    #[arg(
        num_args = 2..=3,
        value_names = ["SCOPE", "KEY", "VALUE"],
        help = "[SCOPE] KEY VALUE"
    )]
    pub args: Vec<String>,

    #[command(flatten)]
    pub scope: ScopeArgs,
}

impl VaultSetArgs {
    /// `(positional scope, key, value)`.
    pub fn parts(&self) -> (Option<&str>, &str, &str) {
        match self.args.as_slice() {
            [scope, key, value] => (Some(scope.as_str()), key.as_str(), value.as_str()),
            [key, value] => (None, key.as_str(), value.as_str()),
            _ => (None, "", ""),
        }
    }
}

#[derive(Debug, Args)]
#[command(about = "Address one key.")]
pub struct VaultKeyArgs {
    #[arg(num_args = 1..=2, value_names = ["SCOPE", "KEY"], help = "[SCOPE] KEY")]
    pub args: Vec<String>,

    #[command(flatten)]
    pub scope: ScopeArgs,
}

impl VaultKeyArgs {
    /// `(positional scope, key)`.
    pub fn parts(&self) -> (Option<&str>, &str) {
        match self.args.as_slice() {
            [scope, key] => (Some(scope.as_str()), key.as_str()),
            [key] => (None, key.as_str()),
            _ => (None, ""),
        }
    }
}

#[derive(Debug, Args)]
#[command(about = "Read a value.")]
pub struct VaultGetArgs {
    #[command(flatten)]
    pub key: VaultKeyArgs,

    #[arg(short = 'r', long, help = "Decrypt with the local identity.")]
    pub reveal: bool,
}

#[derive(Debug, Args)]
pub struct VaultScopeOnlyArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,
}

#[derive(Debug, Args)]
pub struct VaultDumpArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(short = 'r', long, help = "Print decrypted dotenv lines.")]
    pub reveal: bool,
}

#[derive(Debug, Args)]
pub struct VaultEncryptArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, help = "Also normalise the recipient header block.")]
    pub format: bool,
}

#[derive(Debug, Args)]
pub struct VaultCheckArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, help = "Scan the git index instead of the working tree.")]
    pub staged: bool,

    #[arg(long, help = "Scan every dotenv file, not only the resolved scope.")]
    pub all: bool,

    #[arg(long, help = "Also scan .env.example/.sample/.template/.dist files.")]
    pub include_examples: bool,

    #[arg(long, default_value = ".", help = "Directory used for git and file discovery.")]
    pub vault_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct RecipientsArgs {
    #[command(subcommand)]
    pub command: RecipientsSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum RecipientsSubcommands {
    #[command(about = "Print recipients and their fingerprint.")]
    List(VaultScopeOnlyArgs),
    #[command(about = "Add an age recipient (existing values are not re-encrypted).")]
    Add(RecipientArgs),
    #[command(about = "Remove an age recipient.")]
    Remove(RecipientArgs),
}

#[derive(Debug, Args)]
pub struct RecipientArgs {
    #[arg(help = "age1... recipient.")]
    pub recipient: String,

    #[command(flatten)]
    pub scope: ScopeArgs,
}

#[derive(Debug, Args)]
pub struct VaultHistoryArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(short = 'n', long, default_value_t = 20, help = "Max revisions.")]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub command: BackupSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum BackupSubcommands {
    #[command(about = "Upload the local scope file to vault_backup.")]
    Push(BackupPushArgs),
    #[command(about = "Restore the local scope file from vault_backup.")]
    Pull(BackupPullArgs),
}

#[derive(Debug, Args)]
pub struct BackupPushArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, help = "Upload even when plaintext values are present.")]
    pub allow_plaintext: bool,
}

#[derive(Debug, Args)]
pub struct BackupPullArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, help = "Overwrite an existing local file.")]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct VaultRunArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long, help = "Run even when the scope holds plaintext values.")]
    pub allow_plaintext: bool,

    #[arg(long, help = "Run the command line through `$SHELL -lc`.")]
    pub shell: bool,

    #[arg(long, requires = "shell", help = "Use -ic instead of -lc (loads interactive rc files).")]
    pub shell_interactive: bool,

    #[arg(long, requires = "shell", help = "Shell binary (defaults to $SHELL, then /bin/bash).")]
    pub shell_path: Option<PathBuf>,

    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "CMD",
        help = "Command and arguments, usually after `--`."
    )]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TrustArgs {
    #[command(subcommand)]
    pub command: TrustSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum TrustSubcommands {
    #[command(about = "Compare the current recipient fingerprint with the pinned one.")]
    Status(VaultScopeOnlyArgs),
    #[command(about = "Pin the current recipient fingerprint.")]
    Accept(TrustAcceptArgs),
    #[command(about = "Remove the pinned fingerprint.")]
    Forget(VaultScopeOnlyArgs),
}

#[derive(Debug, Args)]
pub struct TrustAcceptArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(short = 'y', long, help = "Accept without prompting.")]
    pub yes: bool,
}

#[derive(Debug, Args)]
pub struct HooksArgs {
    #[command(subcommand)]
    pub command: HooksSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum HooksSubcommands {
    #[command(about = "Write the managed pre-commit hook.")]
    Install(HookInstallArgs),
    #[command(about = "Report missing, installed or foreign.")]
    Status(HookDirArgs),
    #[command(about = "Remove the managed pre-commit hook.")]
    Uninstall(HookDirArgs),
}

#[derive(Debug, Args)]
pub struct HookDirArgs {
    #[arg(long, default_value = ".", help = "Directory inside the git repository.")]
    pub vault_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct HookInstallArgs {
    #[command(flatten)]
    pub dir: HookDirArgs,

    #[arg(long, help = "Replace a hook that si did not write.")]
    pub force: bool,

    #[arg(long, help = "si binary the hook runs (defaults to this executable).")]
    pub si_bin: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AuthArgs {
    #[command(subcommand)]
    pub command: AuthSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum AuthSubcommands {
    #[command(about = "Verify and save a base URL and token.")]
    Login(AuthLoginArgs),
    #[command(about = "Call whoami with the resolved credentials.")]
    Status,
    #[command(about = "Remove the saved credentials file.")]
    Logout,
}

#[derive(Debug, Args)]
pub struct AuthLoginArgs {
    #[arg(long, help = "Sun API base URL.")]
    pub url: String,

    #[arg(long, env = "SI_SUN_LOGIN_TOKEN", hide_env_values = true, help = "Bearer token.")]
    pub token: String,
}

#[derive(Debug, Args)]
pub struct TaskboardArgs {
    #[command(subcommand)]
    pub command: TaskboardSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum TaskboardSubcommands {
    #[command(about = "Persist the default board and/or agent id.")]
    Use(BoardUseArgs),
    #[command(about = "Print the board, its counts and tasks.")]
    Show(BoardArgs),
    #[command(about = "List tasks in display order.")]
    List(BoardListArgs),
    #[command(about = "Add a todo task.")]
    Add(BoardAddArgs),
    #[command(about = "Claim a task (highest priority, oldest first without --id).")]
    Claim(BoardClaimArgs),
    #[command(about = "Give a claimed task back.")]
    Release(BoardTaskArgs),
    #[command(about = "Mark a task done.")]
    Done(BoardDoneArgs),
}

#[derive(Debug, Args)]
pub struct BoardArgs {
    #[arg(short = 'n', long, help = "Board name.")]
    pub name: Option<String>,
}

#[derive(Debug, Args)]
pub struct BoardUseArgs {
    #[command(flatten)]
    pub board: BoardArgs,

    #[arg(short = 'a', long, help = "Agent id.")]
    pub agent: Option<String>,
}

#[derive(Debug, Args)]
pub struct BoardListArgs {
    #[command(flatten)]
    pub board: BoardArgs,

    #[arg(long, help = "todo, doing or done (aliases accepted).")]
    pub status: Option<String>,

    #[arg(long, help = "Only tasks locked by this agent.")]
    pub owner: Option<String>,

    #[arg(short = 'l', long, default_value_t = 50, help = "Max rows; 0 for all.")]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct BoardAddArgs {
    #[command(flatten)]
    pub board: BoardArgs,

    #[arg(short = 't', long, help = "Task title.")]
    pub title: String,

    #[arg(short = 'p', long, help = "Prompt (defaults to the title).")]
    pub prompt: Option<String>,

    #[arg(long, default_value = "P2", help = "P1, P2 or P3.")]
    pub priority: String,

    #[arg(long, help = "Comma-separated tags.")]
    pub tags: Option<String>,
}

#[derive(Debug, Args)]
pub struct BoardClaimArgs {
    #[command(flatten)]
    pub board: BoardArgs,

    #[arg(long, help = "Task id to claim.")]
    pub id: Option<String>,

    #[arg(short = 'a', long, help = "Agent id.")]
    pub agent: Option<String>,

    #[arg(long, help = "Lease length in seconds.")]
    pub lease_seconds: Option<i64>,
}

#[derive(Debug, Args)]
pub struct BoardTaskArgs {
    #[command(flatten)]
    pub board: BoardArgs,

    #[arg(long, help = "Task id.")]
    pub id: String,

    #[arg(short = 'a', long, help = "Agent id.")]
    pub agent: Option<String>,
}

#[derive(Debug, Args)]
pub struct BoardDoneArgs {
    #[command(flatten)]
    pub task: BoardTaskArgs,

    #[arg(long, help = "Result summary stored on the task.")]
    pub result: Option<String>,
}

#[derive(Debug, Args)]
pub struct MachineArgs {
    #[command(subcommand)]
    pub command: MachineSubcommands,
}

#[derive(Debug, Subcommand)]
#[allow(clippy::large_enum_variant)]
pub enum MachineSubcommands {
    #[command(about = "Register or update this machine.")]
    Register(MachineRegisterArgs),
    #[command(about = "Show one machine record.")]
    Status(MachineIdArgs),
    #[command(about = "List registered machines.")]
    List(MachineListArgs),
    #[command(about = "Grant an operator access (owner only).")]
    Allow(MachineGrantArgs),
    #[command(about = "Revoke an operator's access (owner only).")]
    Deny(MachineRevokeArgs),
    #[command(about = "Queue an si command on another machine: run --machine <id> -- <args>.")]
    Run(MachineRunArgs),
    #[command(about = "List queued and finished jobs.")]
    Jobs(MachineJobsArgs),
    #[command(about = "Execute queued jobs addressed to this machine.")]
    Serve(MachineServeArgs),
}

#[derive(Debug, Args)]
pub struct MachineIdArgs {
    #[arg(short = 'm', long, help = "Machine id (defaults to this machine).")]
    pub machine: Option<String>,
}

#[derive(Debug, Args)]
pub struct OperatorArgs {
    #[arg(long, visible_alias = "as", help = "Operator id.")]
    pub operator: Option<String>,
}

#[derive(Debug, Args)]
pub struct MachineRegisterArgs {
    #[command(flatten)]
    pub machine: MachineIdArgs,

    #[command(flatten)]
    pub operator: OperatorArgs,

    #[arg(long, help = "Human-readable name.")]
    pub display_name: Option<String>,

    #[arg(long, value_delimiter = ',', help = "Comma-separated operator ids to allow.")]
    pub allow_operators: Vec<String>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true", help = "May dispatch jobs to other machines.")]
    pub can_control_others: Option<bool>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true", help = "Accepts remote jobs.")]
    pub can_be_controlled: Option<bool>,

    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Persist machine and operator ids to settings."
    )]
    pub set_defaults: bool,
}

#[derive(Debug, Args)]
pub struct MachineListArgs {
    #[arg(short = 'l', long, default_value_t = 200, help = "Max rows.")]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct MachineGrantArgs {
    #[command(flatten)]
    pub machine: MachineIdArgs,

    #[command(flatten)]
    pub operator: OperatorArgs,

    #[arg(long, help = "Operator id to allow.")]
    pub grant: String,
}

#[derive(Debug, Args)]
pub struct MachineRevokeArgs {
    #[command(flatten)]
    pub machine: MachineIdArgs,

    #[command(flatten)]
    pub operator: OperatorArgs,

    #[arg(long, help = "Operator id to revoke.")]
    pub revoke: String,
}

#[derive(Debug, Args)]
pub struct MachineRunArgs {
    #[arg(short = 'm', long, help = "Target machine id.")]
    pub machine: String,

    #[arg(long, help = "Requesting machine id (defaults to this machine).")]
    pub source_machine: Option<String>,

    #[command(flatten)]
    pub operator: OperatorArgs,

    #[arg(long, default_value_t = 900, help = "Remote command timeout.")]
    pub timeout_seconds: u64,

    #[arg(long, help = "Poll until the job finishes.")]
    pub wait: bool,

    #[arg(long, default_value_t = 1200, help = "Max wait with --wait.")]
    pub wait_timeout_seconds: u64,

    #[arg(long, default_value_t = 2, help = "Poll interval with --wait.")]
    pub poll_seconds: u64,

    #[arg(last = true, required = true, help = "si arguments to run remotely.")]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct MachineJobsArgs {
    #[arg(short = 'm', long, help = "Target machine filter.")]
    pub machine: Option<String>,

    #[arg(long, help = "Requesting operator filter.")]
    pub requested_by: Option<String>,

    #[arg(long, help = "queued, running, succeeded, failed or denied.")]
    pub status: Option<String>,

    #[arg(short = 'l', long, default_value_t = 200, help = "Max jobs.")]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct MachineServeArgs {
    #[command(flatten)]
    pub machine: MachineIdArgs,

    #[arg(long, default_value_t = 2, help = "Queue poll interval.")]
    pub poll_seconds: u64,

    #[arg(long, help = "Process at most one job, then exit.")]
    pub once: bool,

    #[arg(long, default_value_t = 0, help = "Exit after this many jobs (0 = unlimited).")]
    pub max_jobs: usize,
}
