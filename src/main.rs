mod cache;
mod config;
mod db;
mod error;
mod event;
mod net;
mod outbox;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::{CacheStorage, SqliteStorage};
use config::Config;
use error::WorkerError;
use event::{EventHandler, WorkerEvent};
use net::{HttpNetwork, Method, Request};
use outbox::{Endpoints, SqliteOutbox};
use worker::{push, ClientMessage, Registration, WorkerHost};

type Host = WorkerHost<SqliteStorage, SqliteOutbox, HttpNetwork>;

#[derive(Parser, Debug)]
#[command(name = "bostarter-sw")]
#[command(about = "Offline-first worker host for the BOSTARTER web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./bostarter-sw.yaml, then $XDG_CONFIG_HOME/bostarter-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest for the configured version
  Install,
  /// Activate the waiting worker after the previous one went away
  Activate,
  /// Send SKIP_WAITING to the waiting worker ("apply update")
  SkipWaiting,
  /// Fetch a URL through the controlling worker
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
    /// Extra header, "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Drop one cached response from the active version's bucket
  Evict {
    /// Absolute URL or path relative to the origin
    url: String,
  },
  /// Send a write to the API, queueing it for background sync when offline
  Submit {
    /// Logical operation name, e.g. create_project
    target: String,
    /// JSON payload
    payload: String,
  },
  /// Queue a write for background sync
  Enqueue { target: String, payload: String },
  /// Run one background-sync cycle
  Sync {
    /// Sync tag (default: the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Show the notification a push payload produces
  Push { text: Option<String> },
  /// Resolve a notification click
  Click { action: Option<String> },
  /// Keep serving: periodic background sync plus JSON messages on stdin
  Watch {
    /// Seconds between sync triggers (default: sync_interval_secs)
    #[arg(long)]
    interval: Option<u64>,
  },
  /// Show registration, buckets and outbox state
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config)?;

  match args.command {
    Command::Install => {
      let mut host = open_host(&config)?;
      let state = host.install().await?;
      println!("{} {:?}", config.version, state);
    }
    Command::Activate => {
      let mut host = open_host(&config)?;
      host.handle_event(WorkerEvent::Activate).await?;
      let worker = host.serving();
      println!("{} {:?}", worker.version(), worker.state());
    }
    Command::SkipWaiting => {
      let mut host = open_host(&config)?;
      host
        .handle_event(WorkerEvent::Message(ClientMessage::SkipWaiting))
        .await?;
      let worker = host.serving();
      println!("{} {:?}", worker.version(), worker.state());
    }
    Command::Fetch {
      url,
      method,
      data,
      headers,
    } => {
      let host = open_host(&config)?;
      let mut request = Request::new(method, config.resolve(&url)?);
      for header in headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header {:?}, expected \"Name: value\"", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(body) = data {
        request = request.with_body(body);
      }

      let outcome = host.serving().fetch(request).await?;
      info!(
        route = outcome.route.as_str(),
        source = outcome.source.map(|s| s.as_str()).unwrap_or("-"),
        status = outcome.response.status,
        content_type = outcome.response.header("content-type").unwrap_or("-"),
        cached_at = ?outcome.cached_at,
        "served"
      );
      if outcome.response.is_offline_signal() {
        warn!("offline and not cached, showing the offline response");
      }
      println!("{}", outcome.response.text());
    }
    Command::Evict { url } => {
      let host = open_host(&config)?;
      let request = Request::get(config.resolve(&url)?);
      if host.serving().router().evict(&request)? {
        println!("evicted {}", request.url);
      } else {
        println!("not cached: {}", request.url);
      }
    }
    Command::Submit { target, payload } => {
      let payload: serde_json::Value = serde_json::from_str(&payload)?;
      let host = open_host(&config)?;
      let worker = host.serving();
      let url = Endpoints::from_config(&config)?.resolve(&target)?;
      let request = Request::new(Method::Post, url).with_json(&payload);

      match worker.fetch(request).await {
        Ok(outcome) => {
          println!("{} {}", outcome.response.status, outcome.response.text());
        }
        Err(WorkerError::Network(e)) if e.is_offline() => {
          let operation = worker.outbox().enqueue(&target, payload)?;
          warn!(error = %e, "API unreachable, saved for background sync");
          println!(
            "queued {} (sync tag {}, {} pending)",
            operation.id,
            config.sync_tag,
            worker.outbox().len()?
          );
        }
        Err(e) => return Err(e.into()),
      }
    }
    Command::Enqueue { target, payload } => {
      let payload: serde_json::Value = serde_json::from_str(&payload)?;
      let host = open_host(&config)?;
      let operation = host.serving().outbox().enqueue(&target, payload)?;
      println!("queued {}", operation.id);
    }
    Command::Sync { tag } => {
      let host = open_host(&config)?;
      let tag = tag.unwrap_or_else(|| config.sync_tag.clone());
      match host.serving().sync(&tag).await? {
        Some(report) => {
          for (operation, failure) in &report.failures {
            println!("retained {} {}: {}", operation.id, operation.target, failure);
          }
          println!(
            "delivered {}, retained {}, in flight elsewhere {}, delivered but not removed {}",
            report.delivered, report.retained, report.in_flight, report.unremoved
          );
        }
        None => println!("no sync registered for tag {:?}", tag),
      }
    }
    Command::Push { text } => {
      let notification = push::Notification::from_push(text.as_deref());
      println!("{}", serde_json::to_string_pretty(&notification)?);
    }
    Command::Click { action } => {
      println!(
        "{}",
        serde_json::to_string(&push::on_click(action.as_deref()))?
      );
    }
    Command::Watch { interval } => {
      let mut host = open_host(&config)?;
      watch(&mut host, &config, interval).await?;
    }
    Command::Status => status(&config)?,
  }

  Ok(())
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  match &config.log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "bostarter-sw.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .try_init()?;
      Ok(None)
    }
  }
}

fn open_host(config: &Config) -> Result<Host> {
  let path = config.storage_path()?;
  Ok(WorkerHost::new(
    config.clone(),
    Arc::new(SqliteStorage::open(&path)?),
    Arc::new(SqliteOutbox::open(&path)?),
    Arc::new(HttpNetwork::new(config)?),
    Arc::new(Registration::open(&path)?),
  )?)
}

async fn watch(host: &mut Host, config: &Config, interval: Option<u64>) -> Result<()> {
  let interval = interval
    .map(std::time::Duration::from_secs)
    .unwrap_or_else(|| config.sync_interval());
  let mut events = EventHandler::new().with_sync_schedule(config.sync_tag.clone(), interval);

  // Page -> worker messages, one JSON object per line
  let tx = events.sender();
  tokio::spawn(async move {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
      if line.trim().is_empty() {
        continue;
      }
      match serde_json::from_str::<ClientMessage>(&line) {
        Ok(message) => {
          if tx.send(WorkerEvent::Message(message)).is_err() {
            break;
          }
        }
        Err(e) => warn!(error = %e, "ignoring malformed message"),
      }
    }
  });

  // Worker -> page notifications
  let mut notifications = host.clients().subscribe();
  tokio::spawn(async move {
    loop {
      match notifications.recv().await {
        Ok(notification) => match serde_json::to_string(&notification) {
          Ok(json) => println!("{}", json),
          Err(e) => warn!(error = %e, "failed to encode notification"),
        },
        Err(RecvError::Lagged(skipped)) => warn!(skipped, "notifications dropped"),
        Err(RecvError::Closed) => break,
      }
    }
  });

  info!(version = %host.serving().version(), state = ?host.serving().state(), "watching");
  tokio::select! {
    _ = host.run(&mut events) => {}
    _ = tokio::signal::ctrl_c() => info!("shutting down"),
  }
  Ok(())
}

fn status(config: &Config) -> Result<()> {
  let host = open_host(config)?;
  let worker = host.serving();
  let registration = worker.registration();

  println!("configured version: {}", config.version);
  println!(
    "active: {}",
    registration.active()?.as_deref().unwrap_or("none")
  );
  println!(
    "waiting: {}",
    registration.waiting()?.as_deref().unwrap_or("none")
  );

  println!("buckets:");
  let storage = host.storage();
  for bucket in storage.buckets()? {
    println!("  {} ({} entries)", bucket, storage.list_keys(&bucket)?.len());
  }

  let pending = worker.outbox().pending()?;
  println!("pending operations: {}", pending.len());
  for operation in pending {
    println!(
      "  {} {} queued {}",
      operation.id,
      operation.target,
      operation.created_at.to_rfc3339()
    );
  }

  Ok(())
}
