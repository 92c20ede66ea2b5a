//! Network transport used for pre-caching and cache misses.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{CachedResponse, Request};

/// Something that can perform a live fetch.
///
/// A non-2xx status is still a successful fetch; only transport failures
/// (DNS, connection, TLS, body read) are errors.
pub trait Transport: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<CachedResponse>> + Send;
}

/// Transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Transport for HttpTransport {
  async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let response = self
      .client
      .request(method, request.url.clone())
      .headers(header_map(&request.headers)?)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let url = response.url().to_string();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "fetched");

    Ok(CachedResponse {
      url,
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
      cached_at: Utc::now(),
    })
  }
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
  let mut map = HeaderMap::new();
  for (name, value) in headers {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
    let value =
      HeaderValue::from_str(value).map_err(|e| eyre!("Invalid header value {}: {}", value, e))?;
    map.append(name, value);
  }
  Ok(map)
}

/// Resolve a resource identifier against the origin.
///
/// Absolute URLs are used as-is; paths like `/index.html` are joined onto
/// the origin.
pub fn resolve(origin: &Url, target: &str) -> Result<Url> {
  match Url::parse(target) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => origin
      .join(target)
      .map_err(|e| eyre!("Invalid resource {}: {}", target, e)),
    Err(e) => Err(eyre!("Invalid resource {}: {}", target, e)),
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted transport for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  enum Scripted {
    Respond(u16, Vec<u8>),
    Fail(String),
  }

  /// Answers from a fixed table and records every URL it was asked for.
  /// Unknown URLs get a 404.
  #[derive(Default)]
  pub struct ScriptedTransport {
    routes: HashMap<String, Scripted>,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
  }

  impl ScriptedTransport {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn respond(mut self, url: &str, status: u16, body: &str) -> Self {
      self
        .routes
        .insert(url.to_string(), Scripted::Respond(status, body.as_bytes().to_vec()));
      self
    }

    pub fn fail(mut self, url: &str, message: &str) -> Self {
      self
        .routes
        .insert(url.to_string(), Scripted::Fail(message.to_string()));
      self
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
      self.requested.lock().unwrap().clone()
    }
  }

  impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &Request) -> Result<CachedResponse> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.requested.lock().unwrap().push(request.url.to_string());

      let (status, body) = match self.routes.get(request.url.as_str()) {
        Some(Scripted::Respond(status, body)) => (*status, body.clone()),
        Some(Scripted::Fail(message)) => {
          return Err(eyre!("Failed to fetch {}: {}", request.url, message))
        }
        None => (404, b"not found".to_vec()),
      };

      Ok(CachedResponse {
        url: request.url.to_string(),
        status,
        status_text: String::new(),
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body,
        cached_at: Utc::now(),
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_relative_and_absolute() {
    let origin = Url::parse("http://localhost:8000").unwrap();

    assert_eq!(
      resolve(&origin, "/").unwrap().as_str(),
      "http://localhost:8000/"
    );
    assert_eq!(
      resolve(&origin, "/manifest.json").unwrap().as_str(),
      "http://localhost:8000/manifest.json"
    );
    assert_eq!(
      resolve(&origin, "https://cdn.example.com/app.js")
        .unwrap()
        .as_str(),
      "https://cdn.example.com/app.js"
    );
  }

  #[test]
  fn test_header_map_rejects_invalid_names() {
    let ok = header_map(&[("Accept".to_string(), "text/html".to_string())]).unwrap();
    assert_eq!(ok.get("accept").unwrap(), "text/html");

    assert!(header_map(&[("bad header".to_string(), "x".to_string())]).is_err());
  }

  #[tokio::test]
  async fn test_http_transport_reports_connection_failure() {
    let transport = HttpTransport::new(Some(Duration::from_secs(5))).unwrap();
    // Port 9 on localhost is reserved for discard and normally closed
    let request = Request::get(Url::parse("http://127.0.0.1:9/").unwrap());
    assert!(transport.fetch(&request).await.is_err());
  }
}
