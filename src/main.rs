use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use rentsync::api::HttpApi;
use rentsync::config::Config;
use rentsync::realtime::HttpPushChannel;
use rentsync::{
  BulkExecutor, CollectionId, CollectionView, FilterValue, Mutation, Payload, RealtimeBridge,
  SortSpec, SyncStore,
};

#[derive(Parser, Debug)]
#[command(name = "rentsync")]
#[command(about = "Live, paginated view of rental bookings and favorites")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rentsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print a collection and re-print it whenever it changes
  Watch {
    /// bookings or favorites
    collection: String,
    #[arg(short, long, default_value = "")]
    search: String,
    /// Filter as field=value, repeatable
    #[arg(short, long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, FilterValue)>,
    /// Sort field, prefix with '-' for descending
    #[arg(long, allow_hyphen_values = true)]
    sort: Option<String>,
    /// Number of pages to load up front
    #[arg(long, default_value_t = 1)]
    pages: usize,
  },
  /// Remove items, reporting per-item failures
  Remove {
    collection: String,
    #[arg(required = true)]
    ids: Vec<String>,
  },
  /// Cancel a booking
  Cancel { id: String },
}

fn parse_filter(raw: &str) -> Result<(String, FilterValue), String> {
  let (field, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected field=value, got '{}'", raw))?;
  if field.is_empty() {
    return Err(format!("missing field name in '{}'", raw));
  }
  Ok((field.to_string(), FilterValue::parse(value)))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging()?;

  let api = HttpApi::new(&config.api.url, Config::get_api_token(), config.fetch_timeout())?;
  let store = SyncStore::new(
    Arc::new(api.clone()),
    Arc::new(api.clone()),
    config.sync_options(),
  );

  match args.command {
    Command::Watch {
      collection,
      search,
      filters,
      sort,
      pages,
    } => {
      let mut key = store
        .query(CollectionId::new(collection))
        .with_search(search)
        .with_filters(filters.into_iter().collect());
      if let Some(sort) = sort {
        key = key.with_sort(SortSpec::parse(&sort));
      }
      let view = CollectionView::new(store.clone(), key);
      watch(&config, &api, &store, view, pages).await
    }
    Command::Remove { collection, ids } => {
      let collection = CollectionId::new(collection);
      let outcome = BulkExecutor::new(store)
        .bulk_apply(&collection, ids, &Mutation::Remove)
        .await;
      println!("{}", outcome.summary("removed"));
      for (id, reason) in &outcome.failed {
        println!("  {}: {}", id, reason);
      }
      Ok(())
    }
    Command::Cancel { id } => {
      let mut patch = Payload::new();
      patch.insert("status".into(), Value::String("cancelled".into()));
      let record = store
        .mutate(&CollectionId::bookings(), &id, &Mutation::Update(patch))
        .await
        .map_err(|e| eyre!("Failed to cancel booking {}: {}", id, e))?;
      println!("{}", record.summary_line(&CollectionId::bookings()));
      Ok(())
    }
  }
}

async fn watch(
  config: &Config,
  api: &HttpApi,
  store: &SyncStore,
  view: CollectionView,
  pages: usize,
) -> Result<()> {
  let mut bridge = config.realtime.enabled.then(|| {
    let channel = HttpPushChannel::new(api, &config.api.events_path);
    let mut bridge = RealtimeBridge::new(store.clone(), Arc::new(channel));
    bridge.start();
    bridge
  });

  let mut changes = view.subscribe();
  if let Err(err) = view.load().await {
    eprintln!("initial load failed: {}", err);
  }
  for _ in 1..pages.max(1) {
    if !view.has_more() {
      break;
    }
    if let Err(err) = view.load_more().await {
      eprintln!("loading more failed: {}", err);
      break;
    }
  }
  render(&view);

  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);
  loop {
    tokio::select! {
      _ = &mut ctrl_c => break,
      alive = changes.changed() => {
        if !alive {
          break;
        }
        if store.is_stale(&view.key()) && !view.loading() {
          let refresher = view.clone();
          tokio::spawn(async move {
            let _ = refresher.refresh().await;
          });
        }
        render(&view);
      }
    }
  }

  if let Some(bridge) = bridge.as_mut() {
    bridge.stop().await;
  }
  Ok(())
}

fn render(view: &CollectionView) {
  let key = view.key();
  let indicator = if view.connection_status().is_live() {
    "● live".to_string()
  } else {
    format!("○ {}", view.connection_status())
  };

  println!("\n{}  [{}]", key.description(), indicator);
  for item in view.items() {
    println!("  {}", item.summary_line(key.collection()));
  }
  if view.loading() {
    println!("  loading...");
  } else if let Some(err) = view.error() {
    println!("  error: {}", err);
  } else if view.has_more() {
    println!("  (more available)");
  }
}

/// Log to a file under the user data dir so output does not interleave with
/// the printed collection.
fn init_logging() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("rentsync");
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
    &dir,
    "rentsync.log",
  ));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rentsync=info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
