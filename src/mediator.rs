//! Network-first cache mediator.
//!
//! Every intercepted request goes to the network first. Successful responses
//! to safe methods are copied into the current version's cache region in the
//! background; the cache is only read when the network fails.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderName;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CacheStorage, Request, RequestDescriptor, Response};
use crate::net::{Network, NetworkError};
use crate::worker::{ActivateEvent, Clients, FetchEvent, InstallEvent, LifecycleHandler};

/// Lifecycle handler applying the network-first policy to one cache version.
pub struct CacheMediator<S: CacheStorage, N: Network> {
  /// Name of the only region that survives activation
  version: String,
  storage: Arc<S>,
  network: Arc<N>,
  vary_headers: Vec<HeaderName>,
}

impl<S: CacheStorage + 'static, N: Network> CacheMediator<S, N> {
  pub fn new(version: impl Into<String>, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      version: version.into(),
      storage,
      network,
      vary_headers: Vec::new(),
    }
  }

  /// Request headers whose values take part in the cache key.
  pub fn with_vary_headers(mut self, vary_headers: Vec<HeaderName>) -> Self {
    self.vary_headers = vary_headers;
    self
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn descriptor(&self, request: &Request) -> RequestDescriptor {
    RequestDescriptor::from_request(request, &self.vary_headers)
  }

  /// Store a response snapshot without holding up the caller.
  ///
  /// The write runs on the blocking pool and is registered with the event so
  /// the host keeps it alive. Failures are logged and dropped.
  fn spawn_cache_write(&self, event: &mut FetchEvent, key: RequestDescriptor, response: Response) {
    event.wait_until(write_snapshot(
      Arc::clone(&self.storage),
      self.version.clone(),
      key,
      response,
    ));
  }

  /// Look up the fallback for a failed request.
  ///
  /// A read error is logged and treated like a miss, so the caller sees the
  /// network failure rather than a storage error.
  fn offline_fallback(
    &self,
    key: &RequestDescriptor,
    error: NetworkError,
  ) -> Result<CacheResult<Response>, NetworkError> {
    match self.storage.match_entry(&self.version, key) {
      Ok(Some(cached)) => {
        info!(entry = %key.description(), error = %error, "network failed, serving cached response");
        Ok(CacheResult::offline(cached.response, cached.cached_at))
      }
      Ok(None) => {
        debug!(entry = %key.description(), error = %error, "network failed, nothing cached");
        Err(error)
      }
      Err(read_err) => {
        warn!(entry = %key.description(), error = %read_err, "cache read failed during fallback");
        Err(error)
      }
    }
  }
}

/// Delete every region except `version`. Returns the deleted names.
pub fn prune_stale_regions<S: CacheStorage + ?Sized>(storage: &S, version: &str) -> Result<Vec<String>> {
  let mut pruned = Vec::new();
  for name in storage.region_names()? {
    if name == version {
      continue;
    }
    storage.delete_region(&name)?;
    info!(region = %name, "deleted stale cache region");
    pruned.push(name);
  }
  Ok(pruned)
}

async fn write_snapshot<S: CacheStorage + 'static>(
  storage: Arc<S>,
  region: String,
  key: RequestDescriptor,
  response: Response,
) -> Result<()> {
  let description = key.description();
  let written = tokio::task::spawn_blocking(move || storage.put_entry(&region, &key, &response)).await;

  match written {
    Ok(Ok(())) => debug!(entry = %description, "cached response"),
    Ok(Err(e)) => warn!(entry = %description, error = %e, "cache write failed"),
    Err(e) => warn!(entry = %description, error = %e, "cache write task aborted"),
  }
  Ok(())
}

/// Drop stale regions, then take over every open client.
async fn retire_stale_regions<S: CacheStorage + 'static>(
  storage: Arc<S>,
  version: String,
  clients: Clients,
) -> Result<()> {
  let keep = version.clone();
  let pruned = tokio::task::spawn_blocking(move || prune_stale_regions(storage.as_ref(), &keep))
    .await
    .map_err(|e| eyre!("Region cleanup task failed: {}", e))??;

  let claimed = clients.claim()?;
  info!(
    version = %version,
    pruned = pruned.len(),
    claimed,
    "cache mediator activated"
  );
  Ok(())
}

impl<S: CacheStorage + 'static, N: Network> LifecycleHandler for CacheMediator<S, N> {
  fn on_install(&self, event: &mut InstallEvent) {
    debug!(version = %self.version, "install: nothing to precache");
    event.skip_waiting();
  }

  fn on_activate(&self, event: &mut ActivateEvent) {
    let clients = event.clients().clone();
    event.wait_until(retire_stale_regions(
      Arc::clone(&self.storage),
      self.version.clone(),
      clients,
    ));
  }

  fn on_fetch<'a>(
    &'a self,
    event: &'a mut FetchEvent,
  ) -> impl Future<Output = Result<CacheResult<Response>, NetworkError>> + Send + 'a {
    async move {
      let request = event.request().clone();
      let key = self.descriptor(&request);

      match self.network.fetch(&request).await {
        Ok(response) => {
          if response.is_success() && request.is_cacheable_method() {
            self.spawn_cache_write(event, key, response.clone());
          } else {
            debug!(
              entry = %key.description(),
              status = %response.status,
              "response not cacheable"
            );
          }
          Ok(CacheResult::from_network(response))
        }
        Err(error) => self.offline_fallback(&key, error),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CachedResponse, RegionStats, SqliteStorage};
  use crate::net::fake::FakeNetwork;
  use crate::worker::{ClientRegistry, ExtendableEvent, WorkerId};
  use reqwest::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
  use reqwest::{Method, StatusCode};
  use std::sync::{mpsc, Mutex};
  use url::Url;

  const DATA: &str = "https://example.com/api/data";
  const OTHER: &str = "https://example.com/api/other";

  type Mediator<S> = CacheMediator<S, FakeNetwork>;

  fn json(body: &'static str) -> Response {
    Response::new(StatusCode::OK)
      .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
      .with_body(body)
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  fn setup(version: &str) -> Result<(Mediator<SqliteStorage>, Arc<SqliteStorage>, Arc<FakeNetwork>)> {
    let storage = Arc::new(SqliteStorage::open_in_memory()?);
    let network = Arc::new(FakeNetwork::new());
    let mediator = CacheMediator::new(version, Arc::clone(&storage), Arc::clone(&network));
    Ok((mediator, storage, network))
  }

  /// Run one fetch and wait for its background work.
  async fn fetch<S: CacheStorage + 'static>(
    mediator: &Mediator<S>,
    request: Request,
  ) -> Result<CacheResult<Response>, NetworkError> {
    let mut event = FetchEvent::new(request, None);
    let result = mediator.on_fetch(&mut event).await;
    event
      .into_extendable()
      .settle()
      .await
      .expect("background work should not fail");
    result
  }

  async fn activate<S: CacheStorage + 'static>(mediator: &Mediator<S>) -> Result<()> {
    let mut event = ActivateEvent::new(Clients::new(Arc::new(ClientRegistry::new()), WorkerId(1)));
    mediator.on_activate(&mut event);
    event.settle().await
  }

  fn cached(mediator: &Mediator<SqliteStorage>, storage: &SqliteStorage, url: &str) -> Option<CachedResponse> {
    storage
      .match_entry(mediator.version(), &mediator.descriptor(&get(url)))
      .unwrap()
  }

  #[test]
  fn test_install_skips_waiting() -> Result<()> {
    let (mediator, storage, _) = setup("v1")?;
    let mut event = InstallEvent::new();

    mediator.on_install(&mut event);

    assert!(event.skip_waiting_requested());
    assert!(storage.region_names()?.is_empty());
    Ok(())
  }

  #[tokio::test]
  async fn test_activation_deletes_other_versions() -> Result<()> {
    let (mediator, storage, _) = setup("v2")?;
    let key = mediator.descriptor(&get(DATA));
    storage.put_entry("v1", &key, &json("old"))?;
    storage.put_entry("v2", &key, &json("current"))?;
    storage.open_region("v0-beta")?;

    activate(&mediator).await?;

    assert_eq!(storage.region_names()?, vec!["v2".to_string()]);
    assert!(storage.match_entry("v2", &key)?.is_some());
    Ok(())
  }

  #[tokio::test]
  async fn test_activation_claims_clients() -> Result<()> {
    let (mediator, _, _) = setup("v1")?;
    let registry = Arc::new(ClientRegistry::new());
    let client = registry.open(None)?;

    let mut event = ActivateEvent::new(Clients::new(Arc::clone(&registry), WorkerId(7)));
    mediator.on_activate(&mut event);
    event.settle().await?;

    assert_eq!(registry.controller(client)?, Some(WorkerId(7)));
    Ok(())
  }

  #[tokio::test]
  async fn test_successful_get_is_cached() -> Result<()> {
    let (mediator, storage, network) = setup("v1")?;
    network.respond(Method::GET, DATA, json(r#"{"f_time":3.2}"#));

    let result = fetch(&mediator, get(DATA)).await?;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, json(r#"{"f_time":3.2}"#));
    let entry = cached(&mediator, &storage, DATA).expect("response should be cached");
    assert_eq!(entry.response, result.data);
    Ok(())
  }

  #[tokio::test]
  async fn test_repeated_success_overwrites_entry() -> Result<()> {
    let (mediator, storage, network) = setup("v1")?;
    network.respond(Method::GET, DATA, json("first"));
    fetch(&mediator, get(DATA)).await?;
    network.respond(Method::GET, DATA, json("second"));
    fetch(&mediator, get(DATA)).await?;

    let entry = cached(&mediator, &storage, DATA).unwrap();
    assert_eq!(entry.response.body.as_ref(), b"second");
    assert_eq!(
      storage.region_stats()?,
      vec![RegionStats {
        name: "v1".to_string(),
        entries: 1,
        body_bytes: 6,
      }]
    );
    Ok(())
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_cached() -> Result<()> {
    let (mediator, storage, network) = setup("v1")?;
    network.respond(Method::GET, DATA, Response::new(StatusCode::SERVICE_UNAVAILABLE));

    let result = fetch(&mediator, get(DATA)).await?;

    assert_eq!(result.data.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(cached(&mediator, &storage, DATA).is_none());
    Ok(())
  }

  #[tokio::test]
  async fn test_error_status_does_not_replace_cached_entry() -> Result<()> {
    let (mediator, storage, network) = setup("v1")?;
    network.respond(Method::GET, DATA, json("good"));
    fetch(&mediator, get(DATA)).await?;
    network.respond(Method::GET, DATA, Response::new(StatusCode::INTERNAL_SERVER_ERROR));

    fetch(&mediator, get(DATA)).await?;

    assert_eq!(cached(&mediator, &storage, DATA).unwrap().response, json("good"));
    Ok(())
  }

  #[tokio::test]
  async fn test_unsafe_methods_are_not_cached() -> Result<()> {
    let (mediator, storage, network) = setup("v1")?;
    let url = Url::parse(DATA).unwrap();
    network.respond(Method::POST, DATA, json("created"));

    let result = fetch(&mediator, Request::new(Method::POST, url.clone()).with_body("{}")).await?;

    assert_eq!(result.data.body.as_ref(), b"created");
    let key = mediator.descriptor(&Request::new(Method::POST, url));
    assert!(storage.match_entry("v1", &key)?.is_none());
    assert!(storage.region_names()?.is_empty());
    Ok(())
  }

  #[tokio::test]
  async fn test_offline_serves_cached_snapshot() -> Result<()> {
    let (mediator, _, network) = setup("v1")?;
    network.respond(Method::GET, DATA, json(r#"{"recommended":"F"}"#));
    fetch(&mediator, get(DATA)).await?;

    network.set_offline(true);
    let result = fetch(&mediator, get(DATA)).await?;

    assert_eq!(result.source, CacheSource::Offline);
    assert!(result.cached_at.is_some());
    assert_eq!(result.data, json(r#"{"recommended":"F"}"#));
    Ok(())
  }

  #[tokio::test]
  async fn test_offline_miss_returns_original_error() -> Result<()> {
    let (mediator, _, network) = setup("v1")?;
    network.set_offline(true);

    let err = fetch(&mediator, get(OTHER)).await.unwrap_err();

    assert_eq!(err, FakeNetwork::offline_error());
    Ok(())
  }

  #[tokio::test]
  async fn test_offline_snapshot_keeps_raw_header_bytes() -> Result<()> {
    let (mediator, _, network) = setup("v1")?;
    let disposition = HeaderValue::from_bytes(b"attachment; filename=\"caf\xe9.txt\"")?;
    let download = Response::new(StatusCode::OK)
      .with_header(CONTENT_DISPOSITION, disposition.clone())
      .with_body("report");
    network.respond(Method::GET, DATA, download.clone());
    fetch(&mediator, get(DATA)).await?;

    network.set_offline(true);
    let result = fetch(&mediator, get(DATA)).await?;

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.headers[CONTENT_DISPOSITION].as_bytes(), disposition.as_bytes());
    assert_eq!(result.data, download);
    Ok(())
  }

  #[tokio::test]
  async fn test_head_is_cached_separately_from_get() -> Result<()> {
    let (mediator, storage, network) = setup("v1")?;
    let url = Url::parse(DATA).unwrap();
    let head = Response::new(StatusCode::OK)
      .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    network.respond(Method::HEAD, DATA, head.clone());

    let result = fetch(&mediator, Request::new(Method::HEAD, url.clone())).await?;
    assert_eq!(result.source, CacheSource::Network);

    let head_key = mediator.descriptor(&Request::new(Method::HEAD, url));
    assert_eq!(storage.match_entry("v1", &head_key)?.unwrap().response, head);
    assert!(cached(&mediator, &storage, DATA).is_none());

    network.set_offline(true);
    let offline = fetch(&mediator, Request::new(Method::HEAD, Url::parse(DATA).unwrap())).await?;
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data, head);
    assert!(fetch(&mediator, get(DATA)).await.is_err());
    Ok(())
  }

  #[tokio::test]
  async fn test_version_bump_example() -> Result<()> {
    let storage = Arc::new(SqliteStorage::open_in_memory()?);
    let network = Arc::new(FakeNetwork::new());
    network.respond(Method::GET, DATA, json("v1 data"));

    let v1 = CacheMediator::new("v1", Arc::clone(&storage), Arc::clone(&network));
    activate(&v1).await?;
    fetch(&v1, get(DATA)).await?;
    assert!(cached(&v1, &storage, DATA).is_some());

    let v2 = CacheMediator::new("v2", Arc::clone(&storage), Arc::clone(&network));
    activate(&v2).await?;
    assert!(storage.region_names()?.is_empty());

    network.respond(Method::GET, DATA, json("v2 data"));
    fetch(&v2, get(DATA)).await?;
    assert_eq!(storage.region_names()?, vec!["v2".to_string()]);

    network.set_offline(true);
    let offline = fetch(&v2, get(DATA)).await?;
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.body.as_ref(), b"v2 data");

    assert_eq!(
      fetch(&v2, get(OTHER)).await.unwrap_err(),
      FakeNetwork::offline_error()
    );
    Ok(())
  }

  /// Storage that fails every operation.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn region_names(&self) -> Result<Vec<String>> {
      Err(eyre!("storage unavailable"))
    }

    fn open_region(&self, _region: &str) -> Result<()> {
      Err(eyre!("storage unavailable"))
    }

    fn delete_region(&self, _region: &str) -> Result<bool> {
      Err(eyre!("storage unavailable"))
    }

    fn match_entry(&self, _region: &str, _key: &RequestDescriptor) -> Result<Option<CachedResponse>> {
      Err(eyre!("storage unavailable"))
    }

    fn put_entry(&self, _region: &str, _key: &RequestDescriptor, _response: &Response) -> Result<()> {
      Err(eyre!("storage unavailable"))
    }

    fn region_stats(&self) -> Result<Vec<RegionStats>> {
      Err(eyre!("storage unavailable"))
    }
  }

  #[tokio::test]
  async fn test_activation_surfaces_storage_failure() {
    let network = Arc::new(FakeNetwork::new());
    let mediator = CacheMediator::new("v1", Arc::new(BrokenStorage), network);

    let err = activate(&mediator).await.unwrap_err();

    assert!(err.to_string().contains("storage unavailable"));
  }

  #[tokio::test]
  async fn test_failed_cache_write_does_not_affect_response() -> Result<()> {
    let network = Arc::new(FakeNetwork::new());
    network.respond(Method::GET, DATA, json("fresh"));
    let mediator = CacheMediator::new("v1", Arc::new(BrokenStorage), Arc::clone(&network));

    let result = fetch(&mediator, get(DATA)).await?;

    assert_eq!(result.data, json("fresh"));
    Ok(())
  }

  #[tokio::test]
  async fn test_failed_cache_read_returns_network_error() {
    let network = Arc::new(FakeNetwork::new());
    network.set_offline(true);
    let mediator = CacheMediator::new("v1", Arc::new(BrokenStorage), network);

    let err = fetch(&mediator, get(DATA)).await.unwrap_err();

    assert_eq!(err, FakeNetwork::offline_error());
  }

  /// Storage whose writes block until released.
  struct GatedStorage {
    inner: SqliteStorage,
    gate: Mutex<mpsc::Receiver<()>>,
  }

  impl CacheStorage for GatedStorage {
    fn region_names(&self) -> Result<Vec<String>> {
      self.inner.region_names()
    }

    fn open_region(&self, region: &str) -> Result<()> {
      self.inner.open_region(region)
    }

    fn delete_region(&self, region: &str) -> Result<bool> {
      self.inner.delete_region(region)
    }

    fn match_entry(&self, region: &str, key: &RequestDescriptor) -> Result<Option<CachedResponse>> {
      self.inner.match_entry(region, key)
    }

    fn put_entry(&self, region: &str, key: &RequestDescriptor, response: &Response) -> Result<()> {
      self
        .gate
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?
        .recv()
        .map_err(|e| eyre!("gate closed: {}", e))?;
      self.inner.put_entry(region, key, response)
    }

    fn region_stats(&self) -> Result<Vec<RegionStats>> {
      self.inner.region_stats()
    }
  }

  #[tokio::test]
  async fn test_response_does_not_wait_for_cache_write() -> Result<()> {
    let (release, gate) = mpsc::channel();
    let storage = Arc::new(GatedStorage {
      inner: SqliteStorage::open_in_memory()?,
      gate: Mutex::new(gate),
    });
    let network = Arc::new(FakeNetwork::new());
    network.respond(Method::GET, DATA, json("fresh"));
    let mediator = CacheMediator::new("v1", Arc::clone(&storage), network);
    let key = mediator.descriptor(&get(DATA));

    let mut event = FetchEvent::new(get(DATA), None);
    let result = mediator.on_fetch(&mut event).await?;

    // Response is in hand while the write is still blocked
    assert_eq!(result.data, json("fresh"));
    assert!(storage.match_entry("v1", &key)?.is_none());

    let extension: ExtendableEvent = event.into_extendable();
    assert_eq!(extension.pending(), 1);
    release.send(())?;
    extension.settle().await?;

    assert!(storage.match_entry("v1", &key)?.is_some());
    Ok(())
  }
}
