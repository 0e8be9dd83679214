// todo: command-line front end for a todo-store directory
//
// Commands:
//   todo init <project>
//   todo add <title words> [--priority <p>] [--parent <id>] [--depends <ids>] ...
//   todo update <id> [--status <s>] [--reason <text>] [--depends <ids>] ...
//   todo dep add|rm <task> <dep>
//   todo archive [--days <n>]
//   todo backup create|list|restore
//   todo ready | blocked | blockers | critical | depth <id> | impact <id>

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{collections::BTreeSet, env, path::PathBuf};
use todo_store_lib::{
    atomic,
    backup::{BackupKind, BackupRecord},
    config::StoreConfig,
    engine::{NewTask, StoreEngine, TaskUpdate},
    graph::analysis::DEFAULT_MAX_DEPTH,
    logging,
    model::{Priority, Task, TaskId, TaskStatus},
    StoreError,
};

fn print_help() {
    println!(
        r#"todo - durable task store with dependency tracking

USAGE:
    todo [--dir <path>] [-v] [--json] <COMMAND> [ARGS]

COMMANDS:
    init <project>              Create an empty store
    add <title>                 Add a task
    update <id>                 Change fields of a task
    complete <id>               Mark a task done
    dep add <task> <dep>        Make <task> depend on <dep>
    dep rm <task> <dep>         Remove a dependency
    reparent <id> [<parent>]    Move a task under <parent>, or to the top level
    focus [<id>]                Set (or with --clear, clear) the current task
    archive                     Move finished tasks into the archive
    reconcile                   Accept hand edits by recomputing checksums
    validate                    Check both store files
    migrate                     Upgrade store files to the current schema
    backup create               Take a recovery backup
    backup list                 List recovery backups, newest first
    backup restore <id>         Restore a backup (a safety backup is taken first)
    deps <id>                   Tasks <id> depends on
    dependents <id>             Tasks that depend on <id>
    blocked                     Unfinished tasks waiting on unfinished work
    ready                       Tasks that can start now
    depth <id>                  Longest dependency chain below <id>
    impact <id>                 Number of tasks transitively waiting on <id>
    critical                    Longest chain of unfinished work
    blockers                    Unfinished tasks ranked by impact
    cleanup                     Remove stale temp files left by crashed writers
    help                        Show this help message

OPTIONS:
    --dir <path>          Store directory (default: $TODO_STORE_DIR or ./.todo)
    --json                Output in JSON format
    -v, -vv               More log output on stderr
    --title <text>        New title (update)
    --description <text>  Description (add, update)
    --status <s>          pending | active | blocked | done | cancelled (update)
    --reason <text>       Why a task is blocked (update)
    --priority <p>        critical | high | medium | low
    --parent <id>         Parent task (add)
    --depends <ids>       Comma-separated ids; replaces the set on update
    --labels <labels>     Comma-separated labels
    --phase <name>        Project phase
    --note <text>         Focus note
    --clear               Clear the focus
    --days <n>            Archive tasks finished more than <n> days ago
    --kind <k>            snapshot | safety | archive | migration (backup)
    --max-depth <n>       Traversal bound for depth and critical (default 100)

EXAMPLES:
    todo init "release 2.0"
    todo add "Write parser" --priority high --depends T001
    todo update T002 --status blocked --reason "waiting on review"
    todo dep add T003 T002
    todo backup restore snapshot.20260206T131233123Z
"#
    );
}

/// Flags and positional words after the global options are pulled out
#[derive(Default)]
struct Options {
    dir: Option<PathBuf>,
    json: bool,
    verbose: u8,
    clear: bool,
    title: Option<String>,
    description: Option<String>,
    status: Option<String>,
    reason: Option<String>,
    priority: Option<String>,
    parent: Option<String>,
    depends: Option<String>,
    labels: Option<String>,
    phase: Option<String>,
    note: Option<String>,
    days: Option<u32>,
    kind: Option<String>,
    max_depth: Option<usize>,
    words: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut opts = Options::default();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        let mut value = || -> Result<String> {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| anyhow!("{} requires a value", arg))
        };
        match arg {
            "--dir" | "-d" => opts.dir = Some(PathBuf::from(value()?)),
            "--json" => opts.json = true,
            "-v" | "--verbose" => opts.verbose += 1,
            "-vv" => opts.verbose += 2,
            "--clear" => opts.clear = true,
            "--title" => opts.title = Some(value()?),
            "--description" => opts.description = Some(value()?),
            "--status" => opts.status = Some(value()?),
            "--reason" => opts.reason = Some(value()?),
            "--priority" => opts.priority = Some(value()?),
            "--parent" => opts.parent = Some(value()?),
            "--depends" => opts.depends = Some(value()?),
            "--labels" => opts.labels = Some(value()?),
            "--phase" => opts.phase = Some(value()?),
            "--note" => opts.note = Some(value()?),
            "--kind" => opts.kind = Some(value()?),
            "--days" => {
                opts.days = Some(value()?.parse().context("--days must be a whole number")?)
            }
            "--max-depth" => {
                opts.max_depth = Some(
                    value()?
                        .parse()
                        .context("--max-depth must be a positive integer")?,
                )
            }
            other if other.starts_with("--") => bail!("Unknown option: {}", other),
            _ => opts.words.push(args[i].clone()),
        }
        i += 1;
    }
    Ok(opts)
}

fn task_id(raw: &str) -> Result<TaskId> {
    TaskId::parse(raw).map_err(|e| anyhow!(e))
}

fn id_list(raw: &str) -> Result<BTreeSet<TaskId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(task_id)
        .collect()
}

fn label_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn word(opts: &Options, n: usize, usage: &str) -> Result<String> {
    opts.words
        .get(n)
        .cloned()
        .ok_or_else(|| anyhow!("Usage: {}", usage))
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn print_task(task: &Task) {
    let mut line = format!("{}  [{}] {}  ({})", task.id, task.status, task.title, task.priority);
    if !task.depends.is_empty() {
        let deps: Vec<&str> = task.depends.iter().map(TaskId::as_str).collect();
        line.push_str(&format!("  depends: {}", deps.join(",")));
    }
    if let Some(reason) = &task.blocked_by {
        line.push_str(&format!("  blocked by: {}", reason));
    }
    println!("{}", line);
}

fn print_ids(ids: &Vec<TaskId>) {
    if ids.is_empty() {
        println!("(none)");
    }
    for id in ids {
        println!("{}", id);
    }
}

fn print_backup(record: &BackupRecord) {
    let files: Vec<&str> = record.files.iter().map(|f| f.source.as_str()).collect();
    println!(
        "{}  {}  {}",
        record.id,
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        files.join(", ")
    );
}

fn run(args: &[String]) -> Result<()> {
    let opts = parse_args(args)?;
    logging::init_subscriber(logging::level_for_verbosity(opts.verbose));

    let Some(command) = opts.words.first().cloned() else {
        print_help();
        return Ok(());
    };
    if command == "help" || command == "--help" || command == "-h" {
        print_help();
        return Ok(());
    }

    let config = match &opts.dir {
        Some(dir) => StoreConfig::load(dir.clone(), |key| env::var(key).ok()),
        None => StoreConfig::from_env(),
    };
    tracing::debug!(dir = %config.store_dir.display(), "using store");
    let mut engine = StoreEngine::open(config)?;
    let max_depth = opts.max_depth.unwrap_or(DEFAULT_MAX_DEPTH);

    match command.as_str() {
        "init" => {
            let project = word(&opts, 1, "todo init <project>")?;
            let store = engine.init(&project)?;
            println!(
                "Initialized {} (schema {}, checksum {})",
                engine.config().store_dir.display(),
                store.meta.schema_version,
                store.meta.checksum
            );
        }

        "add" => {
            if opts.words.len() < 2 {
                bail!("Usage: todo add <title words> [--priority <p>] [--depends <ids>]");
            }
            let mut new = NewTask::titled(opts.words[1..].join(" "));
            new.description = opts.description.clone();
            new.phase = opts.phase.clone();
            if let Some(p) = &opts.priority {
                new.priority = p.parse::<Priority>().map_err(|e| anyhow!(e))?;
            }
            if let Some(parent) = &opts.parent {
                new.parent_id = Some(task_id(parent)?);
            }
            if let Some(depends) = &opts.depends {
                new.depends = id_list(depends)?;
            }
            if let Some(labels) = &opts.labels {
                new.labels = label_list(labels);
            }
            let task = engine.add_task(new)?;
            emit(opts.json, &task, print_task)?;
        }

        "update" => {
            let id = task_id(&word(&opts, 1, "todo update <id> [--status <s>] ...")?)?;
            let update = TaskUpdate {
                title: opts.title.clone(),
                description: opts.description.clone(),
                status: opts
                    .status
                    .as_deref()
                    .map(str::parse::<TaskStatus>)
                    .transpose()
                    .map_err(|e| anyhow!(e))?,
                priority: opts
                    .priority
                    .as_deref()
                    .map(str::parse::<Priority>)
                    .transpose()
                    .map_err(|e| anyhow!(e))?,
                depends: opts.depends.as_deref().map(id_list).transpose()?,
                labels: opts.labels.as_deref().map(label_list),
                phase: opts.phase.clone(),
                blocked_by: opts.reason.clone(),
            };
            let task = engine.update_task(&id, update)?;
            emit(opts.json, &task, print_task)?;
        }

        "complete" | "done" => {
            let id = task_id(&word(&opts, 1, "todo complete <id>")?)?;
            let task = engine.complete_task(&id)?;
            emit(opts.json, &task, print_task)?;
        }

        "dep" => {
            let usage = "todo dep add|rm <task> <dep>";
            let action = word(&opts, 1, usage)?;
            let task = task_id(&word(&opts, 2, usage)?)?;
            let dep = task_id(&word(&opts, 3, usage)?)?;
            let updated = match action.as_str() {
                "add" => engine.add_dependency(&task, &dep)?,
                "rm" | "remove" => engine.remove_dependency(&task, &dep)?,
                _ => bail!("Usage: {}", usage),
            };
            emit(opts.json, &updated, print_task)?;
        }

        "reparent" => {
            let id = task_id(&word(&opts, 1, "todo reparent <id> [<parent>]")?)?;
            let parent = opts.words.get(2).map(|p| task_id(p)).transpose()?;
            let task = engine.reparent(&id, parent.as_ref())?;
            emit(opts.json, &task, print_task)?;
        }

        "focus" => {
            let target = if opts.clear {
                None
            } else {
                Some(task_id(&word(&opts, 1, "todo focus <id> | todo focus --clear")?)?)
            };
            let focus = engine.set_focus(target.as_ref(), opts.note.clone())?;
            emit(opts.json, &focus, |f| match &f.current_task {
                Some(id) => println!("Focus: {}", id),
                None => println!("Focus cleared"),
            })?;
        }

        "archive" => {
            let report = engine.archive_completed(opts.days)?;
            if report.archived.is_empty() {
                println!("Nothing to archive");
            } else {
                println!(
                    "Archived {} task(s); safety backup {}",
                    report.archived.len(),
                    report.safety_backup.as_deref().unwrap_or("-")
                );
                print_ids(&report.archived);
            }
        }

        "reconcile" => {
            for file in engine.reconcile()? {
                if file.changed {
                    println!(
                        "{}: checksum {} -> {}",
                        file.file,
                        file.previous.as_deref().unwrap_or("(none)"),
                        file.checksum
                    );
                } else {
                    println!("{}: already consistent", file.file);
                }
            }
        }

        "validate" => {
            let report = engine.validate()?;
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            for error in &report.errors {
                println!("error: {}", error);
            }
            if !report.is_ok() {
                eprintln!("{} validation error(s)", report.errors.len());
                std::process::exit(todo_store_lib::ErrorKind::Validation.exit_code());
            }
            println!("Store is valid");
        }

        "migrate" => {
            for report in engine.ensure_compatible_version()? {
                if report.is_noop() {
                    println!("{}: already at {}", report.path.display(), report.to);
                } else {
                    println!(
                        "{}: migrated {} -> {} (backup {})",
                        report.path.display(),
                        report.from,
                        report.to,
                        report.backup_id.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        "backup" => {
            let usage = "todo backup create|list|restore";
            let kind = opts
                .kind
                .as_deref()
                .map(str::parse::<BackupKind>)
                .transpose()
                .map_err(|e| anyhow!(e))?;
            match word(&opts, 1, usage)?.as_str() {
                "create" => {
                    let record = engine.create_backup(kind.unwrap_or(BackupKind::Snapshot))?;
                    print_backup(&record);
                }
                "list" => {
                    let records = engine.list_backups(kind)?;
                    if records.is_empty() {
                        println!("No backups");
                    }
                    records.iter().for_each(print_backup);
                }
                "restore" => {
                    let id = word(&opts, 2, "todo backup restore <id>")?;
                    let outcome = engine.restore_backup(&id)?;
                    println!("Restored {}", outcome.restored.id);
                    if let Some(safety) = &outcome.safety {
                        println!("Previous state saved as {}", safety.id);
                    }
                }
                _ => bail!("Usage: {}", usage),
            }
        }

        "deps" => {
            let id = task_id(&word(&opts, 1, "todo deps <id>")?)?;
            emit(opts.json, &engine.forward_deps(&id)?, print_ids)?;
        }

        "dependents" => {
            let id = task_id(&word(&opts, 1, "todo dependents <id>")?)?;
            emit(opts.json, &engine.reverse_deps(&id)?, print_ids)?;
        }

        "blocked" => emit(opts.json, &engine.blocked_tasks()?, print_ids)?,

        "ready" => emit(opts.json, &engine.ready_tasks()?, print_ids)?,

        "depth" => {
            let id = task_id(&word(&opts, 1, "todo depth <id>")?)?;
            let depth = engine.chain_depth(&id, max_depth)?;
            emit(opts.json, &depth, |d| {
                let more = if d.truncated { "+" } else { "" };
                println!("{}: depth {}{}", id, d.depth, more);
            })?;
        }

        "impact" => {
            let id = task_id(&word(&opts, 1, "todo impact <id>")?)?;
            let count = engine.impact_count(&id)?;
            emit(opts.json, &count, |c| println!("{}: {} dependent task(s)", id, c))?;
        }

        "critical" => {
            let path = engine.critical_path(max_depth)?;
            emit(opts.json, &path, |p| {
                let ids: Vec<&str> = p.path.iter().map(TaskId::as_str).collect();
                if ids.is_empty() {
                    println!("(none)");
                } else {
                    let more = if p.truncated { " -> ..." } else { "" };
                    println!("{}{}", ids.join(" -> "), more);
                }
            })?;
        }

        "blockers" => {
            let ranked = engine.rank_blockers()?;
            emit(opts.json, &ranked, |r| {
                if r.is_empty() {
                    println!("(none)");
                }
                for rank in r {
                    println!("{}  impact {}", rank.id, rank.impact);
                }
            })?;
        }

        "cleanup" => {
            let report = atomic::cleanup_stale_temps(&engine.config().store_dir)?;
            println!(
                "Removed {} stale temp file(s), scanned {}{}",
                report.deleted,
                report.scanned,
                if report.hit_limit { " (scan limit reached)" } else { "" }
            );
        }

        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    if let Err(err) = run(&args) {
        if let Some(store_err) = err.downcast_ref::<StoreError>() {
            eprintln!("Error [{}]: {}", store_err.kind(), store_err);
            eprintln!("Hint: {}", store_err.suggestion());
            std::process::exit(store_err.kind().exit_code());
        }
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
