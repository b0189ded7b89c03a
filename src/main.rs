//! CLI entry point for `mailindex`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mailindex::config::{self, Config};
use mailindex::index::Storage;
use mailindex::{
    BuildReport, ChangeCount, Identity, IndexError, IndexManager, IndexSettings, IndexStats,
    MessageSummary, SearchRequest, SearchScope,
};

#[derive(Parser)]
#[command(
    name = "mailindex",
    version,
    about = "Full-text index over a local .emlx mail store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Mail store root (overrides `store.mail_root`)
    #[arg(long, global = true, value_name = "DIR", env = "MAILINDEX_ROOT")]
    root: Option<PathBuf>,

    /// Index file (overrides `index.db_path`)
    #[arg(long, global = true, value_name = "FILE", env = "MAILINDEX_DB")]
    db: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index from the mail store
    Index {
        /// Delete the index file first and index everything again
        #[arg(long)]
        rebuild: bool,
        #[arg(long)]
        json: bool,
    },
    /// Apply changes made on disk since the last sync
    Sync {
        /// Only sync when the index is older than `index.staleness_hours`
        #[arg(long)]
        if_stale: bool,
        #[arg(long)]
        json: bool,
    },
    /// Search indexed messages
    Search {
        query: String,
        #[arg(short, long, value_enum, default_value_t = SearchScope::All)]
        scope: SearchScope,
        #[arg(short = 'n', long, default_value_t = mailindex::search::DEFAULT_LIMIT)]
        limit: usize,
        /// Account id (directory name in the mail store)
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        mailbox: Option<String>,
        /// Mailboxes to leave out; defaults to `store.exclude_mailboxes`
        #[arg(long = "exclude", value_name = "MAILBOX")]
        exclude: Vec<String>,
        /// Print the total number of matches too
        #[arg(long)]
        count: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show index statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Sync once, then keep the index updated until interrupted
    Watch,
    /// Extract one attachment of an indexed message
    Attachment {
        #[arg(long)]
        account: String,
        #[arg(long)]
        mailbox: String,
        /// Message id (the number in the `.emlx` file name)
        #[arg(long)]
        id: i64,
        filename: String,
        /// Output file; defaults to the attachment name in the current directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the effective configuration, or write it to the config file
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config();
    if let Some(root) = cli.root.clone() {
        config.store.mail_root = Some(root);
    }
    if let Some(db) = cli.db.clone() {
        config.index.db_path = Some(db);
    }

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Index { rebuild, json } => cmd_index(&config, rebuild, json),
        Commands::Sync { if_stale, json } => cmd_sync(&config, if_stale, json),
        Commands::Search {
            query,
            scope,
            limit,
            account,
            mailbox,
            exclude,
            count,
            json,
        } => {
            let mut request = SearchRequest::new(query, scope).limit(limit);
            request.account_id = account;
            request.mailbox = mailbox;
            request.exclude_mailboxes = if exclude.is_empty() {
                config.store.exclude_mailboxes.clone()
            } else {
                exclude
            };
            cmd_search(&config, &request, count, json)
        }
        Commands::Stats { json } => cmd_stats(&config, json),
        Commands::Watch => cmd_watch(&config),
        Commands::Attachment {
            account,
            mailbox,
            id,
            filename,
            output,
        } => cmd_attachment(
            &config,
            &Identity::new(account, mailbox, id),
            &filename,
            output.as_deref(),
        ),
        Commands::Config { init } => cmd_config(&config, init),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mailindex.log");
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

fn open_manager(config: &Config) -> anyhow::Result<IndexManager> {
    let settings = IndexSettings::from_config(config)?;
    match IndexManager::open(settings) {
        Ok(manager) => Ok(manager),
        Err(e @ IndexError::SchemaMismatch { .. }) => {
            anyhow::bail!("{e}\nRun `mailindex index --rebuild` to start over.")
        }
        Err(e) => Err(e.into()),
    }
}

fn progress_bar(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .expect("valid template")
            .progress_chars("#>-"),
    );
    pb.set_message(message);
    pb
}

fn cmd_index(config: &Config, rebuild: bool, json: bool) -> anyhow::Result<()> {
    if rebuild {
        Storage::destroy(config::db_path(config))?;
    }
    let manager = open_manager(config)?;

    let pb = progress_bar("Indexing");
    let start = Instant::now();
    let report = manager.build_index(Some(&|current, total| {
        pb.set_length(total as u64);
        pb.set_position(current as u64);
        true
    }))?;
    pb.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_build_report(&report, start.elapsed());
    }
    Ok(())
}

fn cmd_sync(config: &Config, if_stale: bool, json: bool) -> anyhow::Result<()> {
    let manager = open_manager(config)?;
    if if_stale && !manager.is_stale(manager.settings().staleness_hours)? {
        if !json {
            println!("Index is fresh; nothing to do.");
        }
        return Ok(());
    }

    let pb = progress_bar("Syncing");
    let counts = manager.sync_updates(Some(&|current, total| {
        pb.set_length(total as u64);
        pb.set_position(current as u64);
        true
    }))?;
    pb.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        print_change_count(&counts);
    }
    Ok(())
}

fn cmd_search(config: &Config, request: &SearchRequest, count: bool, json: bool) -> anyhow::Result<()> {
    let manager = open_manager(config)?;
    if !manager.is_index_available() {
        anyhow::bail!("The index is empty. Run `mailindex index` first.");
    }

    let results = manager.search(request)?;
    let total = if count {
        Some(manager.count_matches(request)?)
    } else {
        None
    };

    if json {
        let output = serde_json::json!({
            "query": request.query,
            "scope": request.scope,
            "total": total,
            "results": results,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_search_results(&results, total);
    }
    Ok(())
}

fn cmd_stats(config: &Config, json: bool) -> anyhow::Result<()> {
    let manager = open_manager(config)?;
    let stats = manager.get_stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats, manager.settings().staleness_hours);
    }
    Ok(())
}

fn cmd_watch(config: &Config) -> anyhow::Result<()> {
    let manager = Arc::new(open_manager(config)?);
    let counts = manager.sync_updates(None)?;
    print_change_count(&counts);

    manager.start_watcher(Some(Box::new(|counts: ChangeCount| {
        if counts.total() > 0 || counts.errors > 0 {
            print_change_count(&counts);
        }
    })))?;
    println!(
        "Watching {} (Ctrl-C to stop)",
        manager.settings().mail_root.display()
    );

    while manager.watcher_running() {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
    anyhow::bail!("Watcher stopped unexpectedly")
}

fn cmd_attachment(
    config: &Config,
    identity: &Identity,
    filename: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    let manager = open_manager(config)?;
    let attachment = manager.get_attachment(identity, filename)?;

    let Some(content) = attachment.content else {
        anyhow::bail!(
            "{} is {} and above the extraction limit",
            attachment.metadata.filename,
            format_size(attachment.metadata.size, BINARY)
        );
    };

    let target = match output {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(&attachment.metadata.filename),
    };
    std::fs::write(&target, &content)?;
    println!(
        "Wrote {} ({}, {})",
        target.display(),
        attachment.metadata.mime_type,
        format_size(content.len() as u64, BINARY)
    );
    Ok(())
}

fn cmd_config(config: &Config, init: bool) -> anyhow::Result<()> {
    if init {
        let path = config::save_config(config)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }
    match config::config_file_path() {
        Some(path) => println!("# {}", path.display()),
        None => println!("# no config directory"),
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mailindex", &mut std::io::stdout());
    Ok(())
}

fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

// ── Output ──────────────────────────────────────────────────────

fn print_build_report(report: &BuildReport, elapsed: std::time::Duration) {
    println!("Indexed:          {}", report.indexed);
    println!("Skipped:          {}", report.skipped);
    println!("Over mailbox cap: {}", report.excluded_by_cap);
    if report.removed > 0 {
        println!("Removed:          {}", report.removed);
    }
    if report.cancelled {
        println!("Cancelled before completion.");
    }
    println!("Time:             {:.1}s", elapsed.as_secs_f64());
}

fn print_change_count(counts: &ChangeCount) {
    println!(
        "+{} -{} ~{} updated {} errors {} over cap {}",
        counts.added,
        counts.deleted,
        counts.moved,
        counts.updated,
        counts.errors,
        counts.excluded_by_cap
    );
}

fn print_search_results(results: &[MessageSummary], total: Option<usize>) {
    if results.is_empty() {
        println!("No matches.");
        return;
    }

    for hit in results {
        let date = hit
            .received_at
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".repeat(16));
        println!(
            "{date}  {:<24.24}  {}",
            hit.sender,
            if hit.subject.is_empty() { "(no subject)" } else { hit.subject.as_str() }
        );
        println!(
            "    {}/{} #{}  {}",
            hit.identity.account_id, hit.identity.mailbox, hit.identity.message_id, hit.snippet
        );
    }

    match total {
        Some(total) => println!("\n{} of {} matches", results.len(), total),
        None => println!("\n{} matches", results.len()),
    }
}

fn print_stats(stats: &IndexStats, staleness_threshold: f64) {
    use humansize::{format_size, BINARY};

    println!("Messages:   {}", stats.email_count);
    println!("Index size: {}", format_size(stats.db_size_bytes, BINARY));
    match (stats.last_sync_at, stats.staleness_hours) {
        (Some(at), Some(age)) => {
            let marker = if age > staleness_threshold { " (stale)" } else { "" };
            println!("Last sync:  {} ({age:.1}h ago){marker}", at.format("%Y-%m-%d %H:%M"));
        }
        _ => println!("Last sync:  never"),
    }

    if !stats.per_mailbox.is_empty() {
        println!();
        for mailbox in &stats.per_mailbox {
            println!(
                "{:>8}  {}/{}",
                mailbox.count, mailbox.account_id, mailbox.mailbox
            );
        }
    }
}
