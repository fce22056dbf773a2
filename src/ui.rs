use std::io::{self, IsTerminal};

use crate::machine::{MachineJob, MachineRecord};
use crate::taskboard::engine::BoardView;
use crate::taskboard::Task;
use crate::vault::engine::{DumpOutcome, ListOutcome};

pub fn print_task_table(tasks: &[Task]) {
    let palette = Palette::auto();
    if tasks.is_empty() {
        println!("{}", palette.dim("no tasks matched"));
        return;
    }
    let rows = tasks.iter().map(task_row).collect::<Vec<_>>();
    print!(
        "{}",
        render_table(&["ID", "STATUS", "PRI", "TITLE", "AGENT", "LOCK_UNTIL"], &rows, &palette)
    );
}

pub fn print_board(view: &BoardView) {
    let palette = Palette::auto();
    let board = &view.board;
    let counts = board.counts();
    println!(
        "{} {}",
        palette.heading(&format!("board {}", board.name)),
        palette.dim(&format!("(revision {})", view.revision))
    );
    println!(
        "todo={} doing={} done={}{}",
        counts.todo,
        counts.doing,
        counts.done,
        if board.updated_at.is_empty() {
            String::new()
        } else {
            format!(" updated_at={}", board.updated_at)
        }
    );
    let mut tasks = board.tasks.clone();
    crate::taskboard::model::sort_for_display(&mut tasks);
    print_task_table(&tasks);
}

pub fn print_machines(records: &[MachineRecord]) {
    let palette = Palette::auto();
    if records.is_empty() {
        println!("{}", palette.dim("no machines registered"));
        return;
    }
    let rows = records
        .iter()
        .map(|record| {
            vec![
                record.machine_id.clone(),
                record.owner_operator.clone(),
                yes_no(record.capabilities.can_control_others).to_string(),
                yes_no(record.capabilities.can_be_controlled).to_string(),
                record.acl.allowed_operators.len().to_string(),
                dash(&record.heartbeat.last_state),
                dash(&record.heartbeat.last_seen_at),
            ]
        })
        .collect::<Vec<_>>();
    print!(
        "{}",
        render_table(
            &["MACHINE", "OWNER", "CONTROL", "CONTROLLED", "ACL", "STATE", "LAST_SEEN"],
            &rows,
            &palette
        )
    );
}

pub fn print_jobs(jobs: &[MachineJob]) {
    let palette = Palette::auto();
    if jobs.is_empty() {
        println!("{}", palette.dim("no jobs matched"));
        return;
    }
    let rows = jobs
        .iter()
        .map(|job| {
            vec![
                job.job_id.clone(),
                job.machine_id.clone(),
                job.status.to_string(),
                job.requested_by.clone(),
                job.requested_at.clone(),
                job.command.join(" "),
            ]
        })
        .collect::<Vec<_>>();
    print!(
        "{}",
        render_table(
            &["JOB", "MACHINE", "STATUS", "REQUESTED_BY", "REQUESTED_AT", "COMMAND"],
            &rows,
            &palette
        )
    );
}

pub fn print_machine(record: &MachineRecord) {
    let palette = Palette::auto();
    println!("{}", palette.heading(&format!("machine {}", record.machine_id)));
    if !record.display_name.is_empty() {
        println!("display_name: {}", record.display_name);
    }
    println!("owner: {}", record.owner_operator);
    println!(
        "can_control_others: {}  can_be_controlled: {}",
        record.capabilities.can_control_others, record.capabilities.can_be_controlled
    );
    println!("allowed_operators: {}", record.acl.allowed_operators.join(", "));
    println!(
        "heartbeat: {} {}",
        dash(&record.heartbeat.last_state),
        dash(&record.heartbeat.last_seen_at)
    );
}

pub fn print_vault_list(outcome: &ListOutcome) {
    let palette = Palette::auto();
    println!(
        "{} {}",
        palette.heading(&format!("scope {}", outcome.scope)),
        palette.dim(&format!("({})", outcome.location))
    );
    if outcome.entries.is_empty() {
        println!("{}", palette.dim("no keys"));
        return;
    }
    for entry in &outcome.entries {
        println!("{} {}", palette.id(&entry.key), encryption_label(entry.encrypted, &palette));
    }
}

/// `--reveal` prints dotenv lines; otherwise a key/status table.
pub fn print_dump(outcome: &DumpOutcome) {
    if outcome.revealed {
        for entry in &outcome.entries {
            let value = entry.value.as_deref().unwrap_or_default();
            println!("{}={}", entry.key, crate::dotenv::render_value(value));
        }
        return;
    }
    let palette = Palette::auto();
    let rows = outcome
        .entries
        .iter()
        .map(|entry| {
            vec![
                entry.key.clone(),
                if entry.encrypted { "encrypted" } else { "plaintext" }.to_string(),
            ]
        })
        .collect::<Vec<_>>();
    print!("{}", render_table(&["KEY", "STATE"], &rows, &palette));
}

fn task_row(task: &Task) -> Vec<String> {
    let (agent, lock_until) = match &task.assignment {
        Some(lock) => (dash(&lock.agent_id), dash(&lock.lease_expires_at)),
        None => ("-".to_string(), "-".to_string()),
    };
    vec![
        task.id.clone(),
        task.status.to_string(),
        task.priority.to_string(),
        task.title.clone(),
        agent,
        lock_until,
    ]
}

fn encryption_label(encrypted: bool, palette: &Palette) -> String {
    if encrypted {
        palette.paint("32", "[encrypted]")
    } else {
        palette.paint("31", "[plaintext]")
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn dash(value: &str) -> String {
    if value.trim().is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

/// Left-aligned columns separated by two spaces; the last column is not padded.
fn render_table(headers: &[&str], rows: &[Vec<String>], palette: &Palette) -> String {
    let mut widths = headers.iter().map(|header| header.chars().count()).collect::<Vec<_>>();
    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(index) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }
    let mut out = palette.heading(&table_line(headers.iter().copied(), &widths));
    out.push('\n');
    for row in rows {
        out.push_str(&table_line(row.iter().map(String::as_str), &widths));
        out.push('\n');
    }
    out
}

fn table_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let mut out = String::new();
    for (index, cell) in cells.enumerate() {
        if index > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        if index + 1 < widths.len() {
            let pad = widths[index].saturating_sub(cell.chars().count());
            out.push_str(&" ".repeat(pad));
        }
    }
    out.trim_end().to_string()
}

pub struct Palette {
    enabled: bool,
}

impl Palette {
    pub fn auto() -> Self {
        let enabled = std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal();
        Self { enabled }
    }

    #[cfg(test)]
    fn plain() -> Self {
        Self { enabled: false }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn heading(&self, text: &str) -> String {
        self.paint("1;36", text)
    }

    pub fn dim(&self, text: &str) -> String {
        self.paint("2", text)
    }

    pub fn id(&self, text: &str) -> String {
        self.paint("1;94", text)
    }

    pub fn status(&self, status: &str) -> String {
        let upper = status.to_ascii_uppercase();
        self.paint(status_color_code(status), &format!("[{upper}]"))
    }
}

fn status_color_code(status: &str) -> &'static str {
    match status.trim().to_ascii_lowercase().as_str() {
        "todo" | "queued" => "34",
        "doing" | "running" => "33",
        "done" | "succeeded" => "32",
        "failed" | "denied" => "31",
        _ => "37",
    }
}
