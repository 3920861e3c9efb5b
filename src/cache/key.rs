//! Request descriptors used as cache entry keys.

use reqwest::header::HeaderName;
use sha2::{Digest, Sha256};

use super::traits::Request;

/// Identifying key for a request/response pair in a cache region.
///
/// Two requests with the same method, URL (ignoring the fragment) and values
/// for the configured vary headers map to the same entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
  method: String,
  url: String,
  vary: Vec<(String, String)>,
}

impl RequestDescriptor {
  /// Build the descriptor for a request.
  ///
  /// `vary_headers` lists the header names whose values participate in the
  /// key. Headers missing from the request contribute an empty value.
  pub fn from_request(request: &Request, vary_headers: &[HeaderName]) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);

    let mut vary: Vec<(String, String)> = vary_headers
      .iter()
      .map(|name| {
        let values: Vec<String> = request
          .headers
          .get_all(name)
          .iter()
          .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
          .collect();
        (name.as_str().to_string(), values.join(","))
      })
      .collect();
    vary.sort();
    vary.dedup_by(|a, b| a.0 == b.0);

    Self {
      method: request.method.as_str().to_uppercase(),
      url: url.to_string(),
      vary,
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Stable, fixed-length key for storage.
  pub fn cache_key(&self) -> String {
    let mut input = format!("{} {}\n", self.method, self.url);
    for (name, value) in &self.vary {
      input.push_str(name);
      input.push(':');
      input.push_str(value);
      input.push('\n');
    }

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human-readable form, stored next to the hashed key.
  pub fn description(&self) -> String {
    if self.vary.is_empty() {
      format!("{} {}", self.method, self.url)
    } else {
      let vary: Vec<String> = self
        .vary
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
      format!("{} {} [{}]", self.method, self.url, vary.join(", "))
    }
  }
}
