//! Lifecycle events and the wait-until mechanism.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use futures::FutureExt;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::warn;

use super::clients::{ClientId, Clients};
use crate::cache::Request;

/// An event whose lifetime can be extended by background tasks.
#[derive(Debug, Default)]
pub struct ExtendableEvent {
  pending: Vec<JoinHandle<Result<()>>>,
}

impl ExtendableEvent {
  pub fn new() -> Self {
    Self::default()
  }

  /// Keep the event alive until `task` finishes.
  ///
  /// The task starts running immediately on the runtime.
  pub fn wait_until<F>(&mut self, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.pending.push(tokio::spawn(task));
  }

  /// Number of registered tasks, finished or not.
  pub fn pending(&self) -> usize {
    self.pending.len()
  }

  /// Wait for every registered task. The first failure is returned.
  pub async fn settle(self) -> Result<()> {
    settle(self.pending).await
  }

  pub(crate) fn into_pending(self) -> Vec<JoinHandle<Result<()>>> {
    self.pending
  }
}

/// Await a batch of extension tasks, returning the first failure.
pub(crate) async fn settle(handles: Vec<JoinHandle<Result<()>>>) -> Result<()> {
  let mut first_error = None;

  for outcome in join_all(handles).await {
    let outcome = outcome
      .map_err(|e| eyre!("Lifetime extension task failed: {}", e))
      .and_then(|result| result);

    if let Err(e) = outcome {
      if first_error.is_none() {
        first_error = Some(e);
      } else {
        warn!(error = %e, "additional lifetime extension failure");
      }
    }
  }

  first_error.map_or(Ok(()), Err)
}

/// Take the outcome of a task that has already finished, if it has.
pub(crate) fn try_reap(handle: &mut JoinHandle<Result<()>>) -> Option<Result<()>> {
  if !handle.is_finished() {
    return None;
  }

  (&mut *handle).now_or_never().map(|outcome| {
    outcome
      .map_err(|e| eyre!("Lifetime extension task failed: {}", e))
      .and_then(|result| result)
  })
}

/// Dispatched once when a handler is registered.
#[derive(Debug, Default)]
pub struct InstallEvent {
  extend: ExtendableEvent,
  skip_waiting: bool,
}

impl InstallEvent {
  pub fn new() -> Self {
    Self::default()
  }

  /// Activate as soon as installation finishes, even if an older handler
  /// still controls clients.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  pub fn wait_until<F>(&mut self, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.extend.wait_until(task);
  }

  pub async fn settle(self) -> Result<()> {
    self.extend.settle().await
  }
}

/// Dispatched when a handler becomes the active one.
#[derive(Debug)]
pub struct ActivateEvent {
  extend: ExtendableEvent,
  clients: Clients,
}

impl ActivateEvent {
  pub fn new(clients: Clients) -> Self {
    Self {
      extend: ExtendableEvent::new(),
      clients,
    }
  }

  /// Handle for claiming open clients on behalf of the activating handler.
  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn wait_until<F>(&mut self, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.extend.wait_until(task);
  }

  pub async fn settle(self) -> Result<()> {
    self.extend.settle().await
  }
}

/// Dispatched for every request made by a controlled client.
#[derive(Debug)]
pub struct FetchEvent {
  request: Request,
  client: Option<ClientId>,
  extend: ExtendableEvent,
}

impl FetchEvent {
  pub fn new(request: Request, client: Option<ClientId>) -> Self {
    Self {
      request,
      client,
      extend: ExtendableEvent::new(),
    }
  }

  pub fn request(&self) -> &Request {
    &self.request
  }

  pub fn client_id(&self) -> Option<ClientId> {
    self.client
  }

  /// Keep work alive past the response without delaying it.
  pub fn wait_until<F>(&mut self, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.extend.wait_until(task);
  }

  pub fn into_extendable(self) -> ExtendableEvent {
    self.extend
  }
}
