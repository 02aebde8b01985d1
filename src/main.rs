use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

use lectern::bible::{Highlight, Reference, VersionId};
use lectern::cache::StorageLocations;
use lectern::config::Config;
use lectern::highlights::ChapterLoad;
use lectern::{logging, Lectern};

/// How long mutating commands wait for the server before leaving edits queued
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "lectern")]
#[command(about = "Offline-first Bible content and highlights")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lectern/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Bible version id to use
  #[arg(short, long, global = true)]
  bible: Option<u32>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show a version's metadata
  Version,
  /// Print a chapter's markup, e.g. `GEN.1`
  Chapter { passage: String },
  /// Keep a version, book or chapter available offline
  Download {
    #[arg(long)]
    book: Option<String>,
    #[arg(long, requires = "book")]
    chapter: Option<u32>,
  },
  /// Evict content the signed-in user is no longer entitled to
  Reconcile,
  /// List highlights overlapping a passage, e.g. `GEN.1` or `GEN.1.3-5`
  Highlights { passage: String },
  /// Highlight a passage with a hex color
  Highlight { passage: String, color: String },
  /// Remove the highlight at a passage
  Unhighlight { passage: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let log_dir = match &config.storage.cache_dir {
    Some(dir) => dir.join("logs"),
    None => StorageLocations::default_cache_dir()?.join("logs"),
  };
  let _log_guard = logging::init_logging(&log_dir)?;

  let version = args
    .bible
    .or(config.default_version)
    .map(VersionId)
    .ok_or_else(|| eyre!("No version given. Pass --bible or set default_version in the config."));

  let app = Lectern::new(&config)?;

  match args.command {
    Command::Version => {
      let result = app.versions.fetch(&version?).await?;
      let v = result.data;
      println!("{} ({}) {} [{}]", v.title, v.abbreviation, v.id, v.language_tag);
      for book in &v.books {
        println!("  {:<4} {:<24} {:>3}", book.usfm, book.title, book.chapters);
      }
      println!("source: {:?}", result.source);
    }
    Command::Chapter { passage } => {
      let key = Reference::parse_passage(version?, &passage)?.chapter_key();
      let chapter = app.chapters.get(&key).await?;
      println!("{}", chapter.content);
    }
    Command::Download { book, chapter } => {
      let count = app.download(version?, book.as_deref(), chapter).await?;
      println!("{count} chapters available offline");
    }
    Command::Reconcile => {
      let reconciled = app.reconcile().await?;
      println!(
        "evicted {} versions and {} chapters",
        reconciled.versions, reconciled.chapters
      );
    }
    Command::Highlights { passage } => {
      let range = Reference::parse_passage(version?, &passage)?;
      load_highlights(&app, &range).await?;
      for highlight in app.highlights.highlights_in(&range) {
        println!("{}  #{}", highlight.reference.passage_id(), highlight.color);
      }
    }
    Command::Highlight { passage, color } => {
      let reference = Reference::parse_passage(version?, &passage)?;
      load_highlights(&app, &reference).await?;
      app
        .highlights
        .add_highlights(&[Highlight::new(reference, &color)]);
      sync(&app).await?;
    }
    Command::Unhighlight { passage } => {
      let reference = Reference::parse_passage(version?, &passage)?;
      load_highlights(&app, &reference).await?;
      if app.highlights.remove_highlights(&[reference]).is_none() {
        println!("nothing highlighted there");
      }
      sync(&app).await?;
    }
  }

  Ok(())
}

/// Bring the passage's chapter up to date so edits start from server state.
async fn load_highlights(app: &Lectern, reference: &Reference) -> Result<()> {
  match app
    .highlights
    .load_chapter_highlights(&reference.chapter_key())
    .await?
  {
    ChapterLoad::Refreshed(_) | ChapterLoad::Throttled => Ok(()),
    ChapterLoad::AlreadyLoading => Err(eyre!("highlights for {} are already loading", reference)),
  }
}

/// Wait for queued edits to reach the server.
async fn sync(app: &Lectern) -> Result<()> {
  let queue = app.highlights.queue();
  if tokio::time::timeout(SYNC_TIMEOUT, queue.wait_idle())
    .await
    .is_err()
  {
    return Err(eyre!(
      "server unreachable; {} edits could not be synced",
      queue.pending_operations().len()
    ));
  }
  if queue.failed_operation_count() > 0 {
    return Err(eyre!(
      "{} edits were rejected",
      queue.failed_operation_count()
    ));
  }
  println!("synced");
  Ok(())
}
