use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use trackcache::bugrefs::BugRef;
use trackcache::cache::{CacheStore, NoopStorage, SqliteStorage};
use trackcache::config::Config;
use trackcache::repository::{FetchOutcome, Item, Repository, RepositoryOptions};
use trackcache::tracker::{HttpConnector, ItemKind, TrackerRepo};

#[derive(Parser, Debug)]
#[command(name = "trackcache")]
#[command(about = "Pull-through cache for bug and test trackers")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/trackcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Do not read or write the local cache
  #[arg(long, global = true)]
  no_cache: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Get items from a tracker, using the cache while it is fresh
  Fetch {
    /// Tracker name or abbreviation
    container: String,
    #[arg(required = true)]
    ids: Vec<String>,
    #[arg(long, default_value = "bug")]
    kind: ItemKind,
  },
  /// Re-fetch bugs from their trackers
  Refresh {
    /// Bug references such as bsc#1234
    #[arg(required_unless_present = "from_tags")]
    bugrefs: Vec<BugRef>,
    /// Refresh every bug the tag index mentions
    #[arg(long, conflicts_with = "bugrefs")]
    from_tags: bool,
    #[arg(long, default_value = "default")]
    shard: String,
  },
  /// Read bug tags from a file (or stdin) into the tag index
  Tag {
    #[arg(long, default_value = "default")]
    shard: String,
    file: Option<PathBuf>,
  },
  /// Show the tag index
  Tags {
    #[arg(long, default_value = "default")]
    shard: String,
    /// Only show this test
    test: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let trackers = TrackerRepo::from_config(&config)?;
  let connector = HttpConnector::new(config.request_timeout())?;
  let options = RepositoryOptions::from(&config);

  let ok = if args.no_cache {
    let repo = Repository::new(trackers, connector, NoopStorage, options);
    run(&repo, args.command).await?
  } else {
    let path = config.cache_path()?;
    let storage = SqliteStorage::open(&path)
      .wrap_err_with(|| format!("Failed to open cache at {}", path.display()))?;
    let repo = Repository::new(trackers, connector, storage, options);
    run(&repo, args.command).await?
  };

  Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Returns false when some requested item could not be fetched.
async fn run<S: CacheStore>(repo: &Repository<S, HttpConnector>, command: Command) -> Result<bool> {
  match command {
    Command::Fetch {
      container,
      ids,
      kind,
    } => {
      let outcome = repo.fetch(kind, &container, ids).await?;
      print_outcome(&outcome)
    }
    Command::Refresh {
      bugrefs,
      from_tags,
      shard,
    } => {
      let outcome = if from_tags {
        repo.refresh_tagged(&shard).await?
      } else {
        repo.refresh(&bugrefs).await?
      };
      print_outcome(&outcome)
    }
    Command::Tag { shard, file } => {
      let text = match file {
        Some(path) => std::fs::read_to_string(&path)
          .wrap_err_with(|| format!("Failed to read {}", path.display()))?,
        None => {
          let mut text = String::new();
          std::io::stdin().read_to_string(&mut text)?;
          text
        }
      };
      let found = repo.extract_tags(&shard, &text).await?;
      println!("{} tags merged into {}", found, shard);
      Ok(true)
    }
    Command::Tags { shard, test } => {
      let index = repo.tag_index(&shard)?;
      let tests: Vec<String> = match test {
        Some(test) => vec![test],
        None => index.tests().map(String::from).collect(),
      };

      let mut out = std::io::stdout().lock();
      for test in &tests {
        for tag in index.tags(test) {
          writeln!(out, "{}", serde_json::to_string(tag)?)?;
        }
      }
      Ok(true)
    }
  }
}

fn print_outcome(outcome: &FetchOutcome<Item>) -> Result<bool> {
  let mut out = std::io::stdout().lock();
  for result in &outcome.items {
    let line = serde_json::json!({
      "source": result.source.as_str(),
      "cached_at": result.cached_at,
      "item": &result.data,
    });
    writeln!(out, "{}", line)?;
  }

  for failure in &outcome.failures {
    eprintln!("{} {}: {}", failure.tracker, failure.id, failure.error);
  }
  if let Some(e) = outcome.partial_error() {
    eprintln!("{}", e);
  }

  Ok(outcome.is_complete())
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("--log-file needs a file name: {}", path.display()))?;
  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}
