//! Scripted network for tests.

use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Network, NetworkError};
use crate::cache::{Request, Response};

/// Serves canned responses by method and URL; unknown routes get a 404.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<(Method, String), Response>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, method: Method, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, url.to_string()), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  /// The error returned for every request while offline.
  pub fn offline_error() -> NetworkError {
    NetworkError::Connect("network unreachable".to_string())
  }
}

impl Network for FakeNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, NetworkError>> + Send {
    self.calls.fetch_add(1, Ordering::SeqCst);

    let result = if self.offline.load(Ordering::SeqCst) {
      Err(Self::offline_error())
    } else {
      let routes = self.routes.lock().unwrap();
      Ok(
        routes
          .get(&(request.method.clone(), request.url.to_string()))
          .cloned()
          .unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND)),
      )
    };

    std::future::ready(result)
  }
}
