//! Open clients and which worker controls each of them.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::WorkerId;

/// An open page/connection of the hosting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "client-{}", self.0)
  }
}

#[derive(Debug, Default)]
struct RegistryState {
  next_id: u64,
  controllers: BTreeMap<ClientId, Option<WorkerId>>,
}

/// Controllers of the open clients at one point in time.
#[derive(Debug, Clone, Default)]
pub struct ControllerSnapshot(BTreeMap<ClientId, Option<WorkerId>>);

/// Registry of open clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
  state: Mutex<RegistryState>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> Result<MutexGuard<'_, RegistryState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Register a new client, controlled by `controller` if given.
  pub fn open(&self, controller: Option<WorkerId>) -> Result<ClientId> {
    let mut state = self.state()?;
    state.next_id += 1;
    let id = ClientId(state.next_id);
    state.controllers.insert(id, controller);
    Ok(id)
  }

  /// Forget a client. Returns whether it was open.
  pub fn close(&self, id: ClientId) -> Result<bool> {
    Ok(self.state()?.controllers.remove(&id).is_some())
  }

  /// The worker controlling a client, if any.
  pub fn controller(&self, id: ClientId) -> Result<Option<WorkerId>> {
    Ok(self.state()?.controllers.get(&id).copied().flatten())
  }

  /// Make `worker` the controller of every open client.
  ///
  /// Returns how many clients changed controller.
  pub fn claim(&self, worker: WorkerId) -> Result<usize> {
    let mut state = self.state()?;
    let mut changed = 0;
    for controller in state.controllers.values_mut() {
      if *controller != Some(worker) {
        *controller = Some(worker);
        changed += 1;
      }
    }
    Ok(changed)
  }

  /// Move every client controlled by `from` to `to`.
  pub fn reassign(&self, from: WorkerId, to: Option<WorkerId>) -> Result<usize> {
    let mut state = self.state()?;
    let mut moved = 0;
    for controller in state.controllers.values_mut() {
      if *controller == Some(from) {
        *controller = to;
        moved += 1;
      }
    }
    Ok(moved)
  }

  /// Record the current controller of every open client.
  pub fn snapshot(&self) -> Result<ControllerSnapshot> {
    Ok(ControllerSnapshot(self.state()?.controllers.clone()))
  }

  /// Give clients now controlled by `worker` back their recorded controller.
  ///
  /// Clients opened after the snapshot lose their controller; clients that
  /// have since closed stay closed. Returns how many clients changed.
  pub fn restore(&self, snapshot: &ControllerSnapshot, worker: WorkerId) -> Result<usize> {
    let mut state = self.state()?;
    let mut restored = 0;
    for (id, controller) in state.controllers.iter_mut() {
      if *controller == Some(worker) {
        *controller = snapshot.0.get(id).copied().flatten();
        restored += 1;
      }
    }
    Ok(restored)
  }

  /// Number of clients controlled by `worker`.
  pub fn controlled_by(&self, worker: WorkerId) -> Result<usize> {
    Ok(
      self
        .state()?
        .controllers
        .values()
        .filter(|c| **c == Some(worker))
        .count(),
    )
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.state()?.controllers.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

/// Client access handed to an activating worker.
#[derive(Debug, Clone)]
pub struct Clients {
  registry: Arc<ClientRegistry>,
  worker: WorkerId,
}

impl Clients {
  pub fn new(registry: Arc<ClientRegistry>, worker: WorkerId) -> Self {
    Self { registry, worker }
  }

  pub fn worker(&self) -> WorkerId {
    self.worker
  }

  /// Take control of every open client, so pages loaded before activation
  /// use the new worker without a reload.
  pub fn claim(&self) -> Result<usize> {
    self.registry.claim(self.worker)
  }
}
