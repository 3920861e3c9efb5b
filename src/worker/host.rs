//! Registration and event dispatch for lifecycle handlers.

use color_eyre::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::clients::{ClientId, ClientRegistry, Clients};
use super::events::{settle, try_reap, ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent};
use super::{LifecycleHandler, WorkerId};
use crate::cache::{CacheResult, Request, Response};
use crate::net::{Network, NetworkError};

/// Observable state of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Installed, waiting for the active worker to lose its clients
  Waiting,
  /// Receiving fetch events for the clients it controls
  Activated,
  /// Replaced, or failed to install/activate
  Redundant,
}

struct Worker<H> {
  id: WorkerId,
  handler: H,
}

/// The hosting environment: owns the registration, the open clients, and
/// lifetime extensions of dispatched fetch events.
pub struct Host<H: LifecycleHandler, N: Network> {
  network: Arc<N>,
  clients: Arc<ClientRegistry>,
  active: Option<Worker<H>>,
  waiting: Option<Worker<H>>,
  last_worker: u64,
  extensions: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl<H: LifecycleHandler, N: Network> Host<H, N> {
  /// `network` serves requests from clients no worker controls.
  pub fn new(network: Arc<N>) -> Self {
    Self {
      network,
      clients: Arc::new(ClientRegistry::new()),
      active: None,
      waiting: None,
      last_worker: 0,
      extensions: Mutex::new(Vec::new()),
    }
  }

  pub fn clients(&self) -> &Arc<ClientRegistry> {
    &self.clients
  }

  pub fn active_worker(&self) -> Option<WorkerId> {
    self.active.as_ref().map(|w| w.id)
  }

  pub fn waiting_worker(&self) -> Option<WorkerId> {
    self.waiting.as_ref().map(|w| w.id)
  }

  /// State of a worker this host has registered, `None` for unknown ids.
  pub fn state(&self, id: WorkerId) -> Option<WorkerState> {
    if self.active_worker() == Some(id) {
      Some(WorkerState::Activated)
    } else if self.waiting_worker() == Some(id) {
      Some(WorkerState::Waiting)
    } else if id.0 >= 1 && id.0 <= self.last_worker {
      Some(WorkerState::Redundant)
    } else {
      None
    }
  }

  /// Open a client. New clients are controlled by the active worker.
  pub fn open_client(&self) -> Result<ClientId> {
    let id = self.clients.open(self.active_worker())?;
    debug!(client = %id, controller = ?self.active_worker(), "client opened");
    Ok(id)
  }

  /// Close a client, promoting a waiting worker once the active one
  /// controls no clients anymore.
  pub async fn close_client(&mut self, id: ClientId) -> Result<bool> {
    let closed = self.clients.close(id)?;
    debug!(client = %id, closed, "client closed");

    if self.waiting.is_some() && !self.active_has_clients()? {
      if let Some(worker) = self.waiting.take() {
        info!(worker = %worker.id, "active worker released its last client");
        self.activate(worker).await?;
      }
    }

    Ok(closed)
  }

  fn active_has_clients(&self) -> Result<bool> {
    match &self.active {
      Some(active) => Ok(self.clients.controlled_by(active.id)? > 0),
      None => Ok(false),
    }
  }

  /// Install a handler and activate it when possible.
  ///
  /// Activation happens right away if there is no active worker, if the
  /// active one controls no clients, or if the handler asked to skip
  /// waiting. Otherwise the handler waits (replacing any previous waiting
  /// one) until the active worker's clients are gone.
  pub async fn register(&mut self, handler: H) -> Result<WorkerId> {
    self.last_worker += 1;
    let id = WorkerId(self.last_worker);
    info!(worker = %id, "installing worker");

    let mut event = InstallEvent::new();
    handler.on_install(&mut event);
    let skip_waiting = event.skip_waiting_requested();
    if let Err(e) = event.settle().await {
      error!(worker = %id, error = %e, "install failed");
      return Err(e.wrap_err(format!("Worker {} failed to install", id)));
    }

    let worker = Worker { id, handler };

    if let Some(replaced) = self.waiting.take() {
      debug!(worker = %replaced.id, "waiting worker replaced");
    }

    if !skip_waiting && self.active_has_clients()? {
      info!(worker = %id, "installed, waiting for clients of the active worker to close");
      self.waiting = Some(worker);
    } else {
      self.activate(worker).await?;
    }

    Ok(id)
  }

  async fn activate(&mut self, worker: Worker<H>) -> Result<()> {
    info!(worker = %worker.id, "activating worker");

    let before = self.clients.snapshot()?;
    let mut event = ActivateEvent::new(Clients::new(Arc::clone(&self.clients), worker.id));
    worker.handler.on_activate(&mut event);

    let previous = self.active_worker();

    if let Err(e) = event.settle().await {
      error!(worker = %worker.id, error = %e, "activation failed");
      // Hand back anything the failed worker managed to claim
      if let Err(restore_err) = self.clients.restore(&before, worker.id) {
        warn!(error = %restore_err, "failed to restore client controllers");
      }
      return Err(e.wrap_err(format!("Worker {} failed to activate", worker.id)));
    }

    if let Some(previous) = previous {
      let moved = self.clients.reassign(previous, Some(worker.id))?;
      info!(worker = %previous, clients = moved, "previous worker is now redundant");
    }

    info!(worker = %worker.id, "worker activated");
    self.active = Some(worker);
    Ok(())
  }

  /// Perform a request on behalf of a client.
  ///
  /// Requests from clients controlled by the active worker are dispatched to
  /// it as fetch events; everything else goes straight to the network.
  pub async fn fetch(
    &self,
    client: ClientId,
    request: Request,
  ) -> Result<CacheResult<Response>, NetworkError> {
    let controller = self.clients.controller(client).unwrap_or_else(|e| {
      warn!(client = %client, error = %e, "could not resolve client controller");
      None
    });

    let Some(worker) = self.active.as_ref().filter(|w| Some(w.id) == controller) else {
      debug!(client = %client, url = %request.url, "uncontrolled client, passing through");
      return self
        .network
        .fetch(&request)
        .await
        .map(CacheResult::passthrough);
    };

    let mut event = FetchEvent::new(request, Some(client));
    let result = worker.handler.on_fetch(&mut event).await;
    self.keep_alive(event.into_extendable());
    result
  }

  fn extensions(&self) -> MutexGuard<'_, Vec<JoinHandle<Result<()>>>> {
    self
      .extensions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Hold on to a fetch event's extensions, reaping those already done.
  fn keep_alive(&self, event: ExtendableEvent) {
    let mut extensions = self.extensions();
    extensions.extend(event.into_pending());
    extensions.retain_mut(|handle| match try_reap(handle) {
      Some(Ok(())) => false,
      Some(Err(e)) => {
        warn!(error = %e, "fetch lifetime extension failed");
        false
      }
      None => true,
    });
  }

  /// Number of fetch extensions not yet reaped.
  pub fn pending_extensions(&self) -> usize {
    self.extensions().len()
  }

  /// Wait for every outstanding fetch extension. Failures are logged only.
  pub async fn drain(&self) {
    let handles = std::mem::take(&mut *self.extensions());
    if handles.is_empty() {
      return;
    }

    debug!(count = handles.len(), "draining fetch lifetime extensions");
    if let Err(e) = settle(handles).await {
      warn!(error = %e, "fetch lifetime extension failed");
    }
  }
}
