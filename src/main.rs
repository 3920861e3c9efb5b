use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use netfirst::cache::{CacheResult, CacheStorage, Request, Response, SqliteStorage};
use netfirst::config::{CacheConfig, Config};
use netfirst::logging;
use netfirst::mediator::CacheMediator;
use netfirst::net::HttpNetwork;
use netfirst::worker::{ClientId, Host};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Interval;
use tracing::{info, warn};
use url::Url;

type Mediator = CacheMediator<SqliteStorage, HttpNetwork>;

#[derive(Parser, Debug)]
#[command(name = "netfirst")]
#[command(about = "Network-first offline cache agent")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/netfirst/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Cache version to activate (overrides cache.version)
  #[arg(long, global = true)]
  cache_version: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Perform one request through the mediator
  Fetch {
    url: Url,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Request header as 'Name: value' (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Print response headers to stderr
    #[arg(short, long)]
    include: bool,
  },

  /// Poll a URL through the mediator until interrupted
  Watch {
    url: Url,

    /// Seconds between requests
    #[arg(long, default_value_t = 30)]
    interval: u64,

    /// Stop after this many requests
    #[arg(long)]
    count: Option<u64>,
  },

  /// List cache regions
  Regions,

  /// Install and activate the configured version, pruning stale regions
  Activate,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override cache version if specified on command line
  let config = match args.cache_version {
    Some(version) => config.with_cache_version(version)?,
    None => config,
  };

  let _log_guard = logging::init(&config.log)?;

  match args.command {
    Command::Fetch {
      url,
      method,
      headers,
      data,
      include,
    } => {
      let request = build_request(url, &method, &headers, data)?;
      fetch(&config, request, include).await
    }
    Command::Watch {
      url,
      interval,
      count,
    } => watch(&config, url, Duration::from_secs(interval.max(1)), count).await,
    Command::Regions => regions(&config),
    Command::Activate => activate(&config).await,
  }
}

fn open_storage(config: &CacheConfig) -> Result<SqliteStorage> {
  let storage = match &config.path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };
  Ok(storage.with_quota(config.quota_bytes))
}

/// Build the host, open one client and register the mediator.
///
/// The client is opened first so activation has something to claim.
async fn start(config: &Config) -> Result<(Host<Mediator, HttpNetwork>, ClientId)> {
  let network = Arc::new(HttpNetwork::new(&config.network)?);
  let storage = Arc::new(open_storage(&config.cache)?);
  let mediator = CacheMediator::new(config.cache.version.clone(), storage, Arc::clone(&network))
    .with_vary_headers(config.vary_header_names()?);

  let mut host = Host::new(network);
  let client = host.open_client()?;
  host.register(mediator).await?;

  Ok((host, client))
}

fn build_request(url: Url, method: &str, headers: &[String], data: Option<String>) -> Result<Request> {
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = Request::new(method, url);
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
      .map_err(|e| eyre!("Invalid header name '{}': {}", name, e))?;
    let value = HeaderValue::from_str(value.trim())
      .map_err(|e| eyre!("Invalid header value for {}: {}", name, e))?;
    request = request.with_header(name, value);
  }

  if let Some(data) = data {
    request = request.with_body(data);
  }

  Ok(request)
}

fn describe(result: &CacheResult<Response>) -> String {
  let mut line = format!(
    "{} ({}, {} bytes)",
    result.data.status,
    result.source,
    result.data.body.len()
  );
  if let Some(cached_at) = result.cached_at {
    line.push_str(&format!(", cached {}", cached_at.format("%Y-%m-%d %H:%M:%S UTC")));
  }
  line
}

async fn fetch(config: &Config, request: Request, include: bool) -> Result<()> {
  let (host, client) = start(config).await?;
  let url = request.url.clone();

  let result = host.fetch(client, request).await;
  // Let the cache write finish before the process exits
  host.drain().await;

  let result = result.map_err(|e| eyre!("Request to {} failed: {}", url, e))?;
  eprintln!("{}", describe(&result));
  if include {
    for (name, value) in &result.data.headers {
      eprintln!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
  }

  let mut stdout = std::io::stdout().lock();
  stdout.write_all(&result.data.body)?;
  stdout.flush()?;

  Ok(())
}

async fn watch(config: &Config, url: Url, interval: Duration, count: Option<u64>) -> Result<()> {
  let (host, client) = start(config).await?;
  let mut ticker = tokio::time::interval(interval);
  let mut done = 0;
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  loop {
    if !next_tick(&mut ticker, ctrl_c.as_mut()).await {
      info!("interrupted");
      break;
    }

    let now = chrono::Local::now().format("%I:%M:%S %p");
    match host.fetch(client, Request::get(url.clone())).await {
      Ok(result) => println!("[{}] {}", now, describe(&result)),
      Err(e) => {
        warn!(url = %url, error = %e, "request failed with nothing cached");
        println!("[{}] unavailable: {}", now, e);
      }
    }

    done += 1;
    if count.is_some_and(|count| done >= count) {
      break;
    }
  }

  host.drain().await;
  Ok(())
}

/// Wait for the next tick. Returns false once `shutdown` has fired.
///
/// `shutdown` must outlive the loop so a signal delivered during a fetch is
/// still seen on the next wait.
async fn next_tick<F: Future>(ticker: &mut Interval, shutdown: Pin<&mut F>) -> bool {
  tokio::select! {
    _ = ticker.tick() => true,
    _ = shutdown => false,
  }
}

fn regions(config: &Config) -> Result<()> {
  let storage = open_storage(&config.cache)?;
  let stats = storage.region_stats()?;

  if stats.is_empty() {
    println!("no cache regions");
    return Ok(());
  }

  for region in stats {
    let marker = if region.name == config.cache.version {
      "*"
    } else {
      " "
    };
    println!(
      "{} {:<16} {:>6} entries {:>10} bytes",
      marker, region.name, region.entries, region.body_bytes
    );
  }

  Ok(())
}

async fn activate(config: &Config) -> Result<()> {
  let before = open_storage(&config.cache)?.region_names()?;
  let (host, _) = start(config).await?;
  host.drain().await;
  let after = open_storage(&config.cache)?.region_names()?;

  let pruned: Vec<&String> = before.iter().filter(|name| !after.contains(name)).collect();
  if pruned.is_empty() {
    println!("version {} active, no stale regions", config.cache.version);
  } else {
    for name in pruned {
      println!("deleted region {}", name);
    }
    println!("version {} active", config.cache.version);
  }

  Ok(())
}
