//! Hosting environment for lifecycle handlers.
//!
//! A handler is registered once and then receives three events:
//! - install: the handler may ask to skip the waiting phase
//! - activate: the handler may clean up and claim open clients
//! - fetch: every request made by a client the handler controls
//!
//! Install and activate are not complete until every task registered with
//! `wait_until` has finished. Tasks registered during a fetch keep running
//! after the response is returned and are collected by [`Host::drain`].

mod clients;
mod events;
mod host;

use std::fmt;
use std::future::Future;

use crate::cache::{CacheResult, Response};
use crate::net::NetworkError;

pub use clients::{ClientId, ClientRegistry, Clients, ControllerSnapshot};
pub use events::{ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent};
pub use host::{Host, WorkerState};

/// Identifies one registered handler generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl fmt::Display for WorkerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "worker-{}", self.0)
  }
}

/// The three handlers bound to the host's event dispatch.
pub trait LifecycleHandler: Send + Sync + 'static {
  fn on_install(&self, event: &mut InstallEvent);

  fn on_activate(&self, event: &mut ActivateEvent);

  fn on_fetch<'a>(
    &'a self,
    event: &'a mut FetchEvent,
  ) -> impl Future<Output = Result<CacheResult<Response>, NetworkError>> + Send + 'a;
}
