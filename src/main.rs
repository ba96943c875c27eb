//! CLI entry point for `listarchive`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};

use listarchive::config::{self, Config};
use listarchive::error::ArchiveError;
use listarchive::ingest::{Ingestor, PromptConfirm, RunSummary};
use listarchive::model::message::SourceKind;
use listarchive::parser::header::normalize_id;
use listarchive::source::MessageSource;
use listarchive::store::Store;

#[derive(Parser)]
#[command(
    name = "listarchive",
    version,
    about = "Load mailing list messages into an archive and rebuild their threads"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Archive database (overrides the configured path)
    #[arg(long, global = true, value_name = "PATH", env = "LISTARCHIVE_DB")]
    database: Option<PathBuf>,

    /// Verbose logging (-v per-message status, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Load messages from stdin (default), a directory or an mbox file
    Load {
        /// Name of the list to load messages into
        #[arg(short, long)]
        list: String,
        /// Load every file in this directory
        #[arg(short, long, value_name = "DIR", conflicts_with = "mbox")]
        directory: Option<PathBuf>,
        /// Load every message in this mbox file
        #[arg(short, long, value_name = "FILE")]
        mbox: Option<PathBuf>,
        /// Commit and prompt after each message
        #[arg(short, long)]
        interactive: bool,
    },
    /// Manage mailing lists
    List {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Show a reconstructed thread
    Thread {
        /// Thread id
        #[arg(required_unless_present = "message_id", conflicts_with = "message_id")]
        id: Option<i64>,
        /// Show the thread containing this Message-ID
        #[arg(long)]
        message_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the stored source of a message
    Raw {
        message_id: String,
    },
    /// Save an attachment by id
    Attachment {
        id: i64,
        /// Output file (defaults to the attachment's own name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show recorded load errors
    Errors {
        /// Only errors recorded for this list
        #[arg(short, long)]
        list: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

#[derive(Subcommand)]
enum ListAction {
    /// Create a list, and its group if needed
    Add {
        name: String,
        #[arg(short, long)]
        group: String,
        /// Display position of the group
        #[arg(long)]
        sortkey: Option<i64>,
    },
    /// Show groups and their lists
    Show {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let verbose = cli.verbose > 0;
    let database = cli.database;

    match cli.command {
        Commands::Load {
            list,
            directory,
            mbox,
            interactive,
        } => {
            let store = open_store(&config, database)?;
            cmd_load(&store, &config, &list, directory, mbox, interactive, verbose)
        }
        Commands::List { action } => {
            let store = open_store(&config, database)?;
            match action {
                ListAction::Add {
                    name,
                    group,
                    sortkey,
                } => cmd_list_add(&store, &name, &group, sortkey),
                ListAction::Show { json } => cmd_list_show(&store, json),
            }
        }
        Commands::Thread {
            id,
            message_id,
            json,
        } => {
            let store = open_store(&config, database)?;
            cmd_thread(&store, id, message_id.as_deref(), json)
        }
        Commands::Raw { message_id } => {
            let store = open_store(&config, database)?;
            cmd_raw(&store, &message_id)
        }
        Commands::Attachment { id, output } => {
            let store = open_store(&config, database)?;
            cmd_attachment(&store, id, output.as_deref())
        }
        Commands::Errors { list, json } => {
            let store = open_store(&config, database)?;
            cmd_errors(&store, list.as_deref(), json)
        }
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::log_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "listarchive.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn open_store(config: &Config, cli_override: Option<PathBuf>) -> anyhow::Result<Store> {
    let path = config::database_path(config, cli_override);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    Ok(Store::open(&path, config.database.busy_timeout())?)
}

/// Load messages into a list and print the run summary.
fn cmd_load(
    store: &Store,
    config: &Config,
    list: &str,
    directory: Option<PathBuf>,
    mbox: Option<PathBuf>,
    interactive: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut ingestor = Ingestor::new(store, list, &config.ingest)?;

    let max_size = config.ingest.max_message_size;
    let source = match (directory, mbox) {
        (Some(dir), _) => MessageSource::directory(&dir, max_size)?,
        (None, Some(path)) => MessageSource::mbox(&path, max_size)?,
        (None, None) => {
            if interactive {
                tracing::warn!("Interactive mode has no effect when reading stdin");
            }
            MessageSource::from_reader(std::io::stdin().lock())?
        }
    };
    let interactive = interactive && source.kind() != SourceKind::Stdin;

    let pb = if verbose || interactive || source.remaining() <= 1 {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(source.remaining() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} Loading [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )?
            .progress_chars("#>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    };
    let progress = |s: &RunSummary| {
        pb.inc(1);
        pb.set_message(format!("{} stored, {} skipped", s.processed, s.skipped));
    };

    let start = Instant::now();
    let summary = if interactive {
        let mut prompt = PromptConfirm::new(std::io::stdin().lock(), std::io::stdout());
        ingestor.run(source, Some(&mut prompt), Some(&progress))
    } else {
        ingestor.run(source, None, Some(&progress))
    };
    pb.finish_and_clear();
    let summary = match summary {
        Ok(summary) => summary,
        Err(ArchiveError::Aborted { reason, summary }) => {
            print_summary(list, &summary, start.elapsed());
            anyhow::bail!("Load aborted: {reason}");
        }
        Err(e) => return Err(e.into()),
    };

    print_summary(list, &summary, start.elapsed());
    Ok(())
}

fn print_summary(list: &str, summary: &RunSummary, elapsed: Duration) {
    println!();
    if summary.failed > 0 {
        println!("  Load failed:");
    } else if summary.aborted {
        println!("  Load stopped:");
    } else {
        println!("  Load complete:");
    }
    println!("  {:<20} {}", "List", list);
    println!("  {:<20} {}", "Processed", summary.processed);
    println!("  {:<20} {}", "Skipped", summary.skipped);
    println!("  {:<20} {}", "Failed", summary.failed);
    if summary.merged > 0 {
        println!("  {:<20} {}", "Merged into threads", summary.merged);
    }
    println!(
        "  {:<20} {}",
        "Stored size",
        format_size(summary.bytes, BINARY)
    );
    println!("  {:<20} {:.2?}", "Time", elapsed);
    println!();
}

fn cmd_list_add(store: &Store, name: &str, group: &str, sortkey: Option<i64>) -> anyhow::Result<()> {
    let id = store.create_list(name, group, sortkey)?;
    println!("  Created list {name} (id {id}) in group {group}");
    Ok(())
}

fn cmd_list_show(store: &Store, json: bool) -> anyhow::Result<()> {
    let groups = store.groups()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    if groups.is_empty() {
        println!("  No lists defined.");
        return Ok(());
    }
    for group in &groups {
        println!("  {}", group.name);
        for list in &group.lists {
            println!("    {:<30} (id {})", list.name, list.id);
        }
    }
    Ok(())
}

/// Print a thread in display order, indented by depth.
fn cmd_thread(
    store: &Store,
    id: Option<i64>,
    message_id: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let thread_id = match (id, message_id) {
        (Some(id), _) => id,
        (None, Some(mid)) => {
            let mid = normalize_id(mid);
            match store.message(&mid)? {
                Some(msg) => msg.thread_id,
                None => anyhow::bail!("Message {mid} not found"),
            }
        }
        (None, None) => anyhow::bail!("Give a thread id or --message-id"),
    };

    let thread = store.thread(thread_id)?;
    let lists = store.lists_for_thread(thread_id)?;

    if json {
        let output = serde_json::json!({
            "thread_id": thread_id,
            "lists": lists,
            "messages": thread.nodes,
            "broken_edges": thread.broken_edges,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!();
    println!(
        "  Thread {} ({} message(s)) in {}",
        thread_id,
        thread.nodes.len(),
        if lists.is_empty() {
            "no list".to_string()
        } else {
            lists.join(", ")
        }
    );
    println!();
    for node in &thread.nodes {
        let indent = "  ".repeat(node.depth);
        let from: String = node.from.chars().take(30).collect();
        println!(
            "  {}  {}{:<30}  {}{}",
            node.date.format("%Y-%m-%d %H:%M:%S"),
            indent,
            from,
            node.subject,
            if node.has_attachment { " [att]" } else { "" }
        );
        if node.has_attachment {
            for att in store.attachments_of(node.id)? {
                println!(
                    "  {:<19}  {}  #{} {} ({}, {})",
                    "",
                    indent,
                    att.id,
                    att.filename,
                    att.content_type,
                    format_size(att.size, BINARY)
                );
            }
        }
    }
    if !thread.broken_edges.is_empty() {
        println!();
        println!(
            "  {} parent link(s) ignored (dangling or cyclic)",
            thread.broken_edges.len()
        );
    }
    println!();
    Ok(())
}

fn cmd_raw(store: &Store, message_id: &str) -> anyhow::Result<()> {
    let mid = normalize_id(message_id);
    match store.raw_message(&mid)? {
        Some(raw) => {
            print!("{raw}");
            Ok(())
        }
        None => anyhow::bail!("Message {mid} not found"),
    }
}

fn cmd_attachment(store: &Store, id: i64, output: Option<&Path>) -> anyhow::Result<()> {
    let Some(att) = store.attachment(id)? else {
        anyhow::bail!("Attachment {id} not found");
    };

    let path = match output {
        Some(path) => path.to_path_buf(),
        None => {
            // Only the final component; stored names come from untrusted mail
            let name = Path::new(&att.filename)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| format!("attachment_{id}").into());
            PathBuf::from(name)
        }
    };

    std::fs::write(&path, &att.data)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    println!(
        "  Saved {} ({}, {}) to {}",
        att.filename,
        att.content_type,
        format_size(att.data.len() as u64, BINARY),
        path.display()
    );
    Ok(())
}

fn cmd_errors(store: &Store, list: Option<&str>, json: bool) -> anyhow::Result<()> {
    let list_id = list.map(|name| store.resolve_list(name)).transpose()?;
    let errors = store.load_errors(list_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&errors)?);
        return Ok(());
    }

    println!();
    println!("  {} load error(s)", errors.len());
    println!();
    for e in &errors {
        println!(
            "  {:<5} {}  {:<20} {:<9} {}",
            e.id,
            e.recorded_at.format("%Y-%m-%d %H:%M"),
            e.list,
            e.source_type,
            e.source
        );
        println!("        {} : {}", e.message_id, e.error);
    }
    if !errors.is_empty() {
        println!();
    }
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "listarchive", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}
