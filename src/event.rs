//! Lifecycle events and the dispatch table that routes them to handlers.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use crate::cache::{CacheResult, CacheStorage, CachedResponse, Request};
use crate::net::Transport;
use crate::worker::OfflineCache;

/// Names handlers can be registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
  Install,
  Fetch,
}

impl EventName {
  pub fn as_str(&self) -> &'static str {
    match self {
      EventName::Install => "install",
      EventName::Fetch => "fetch",
    }
  }
}

impl std::fmt::Display for EventName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EventName {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "install" => Ok(EventName::Install),
      "fetch" => Ok(EventName::Fetch),
      other => Err(eyre!("Unknown event: {}", other)),
    }
  }
}

/// Events the host delivers
#[derive(Debug, Clone)]
pub enum Event {
  /// One-time setup trigger
  Install,
  /// A resource request to answer
  Fetch(Request),
}

impl Event {
  pub fn name(&self) -> EventName {
    match self {
      Event::Install => EventName::Install,
      Event::Fetch(_) => EventName::Fetch,
    }
  }
}

/// What a handler produced
#[derive(Debug, Clone)]
pub enum EventOutcome {
  /// Install finished, with the number of entries stored
  Installed(usize),
  /// A response for a fetch event
  Responded(CacheResult<CachedResponse>),
}

/// A boxed future that returns a handler outcome
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A registered event handler
type HandlerFn = Box<dyn Fn(Event) -> BoxFuture<EventOutcome> + Send + Sync>;

/// Dispatch table keyed by event name.
#[derive(Default)]
pub struct Dispatcher {
  handlers: HashMap<EventName, HandlerFn>,
}

impl Dispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Dispatcher with the offline cache's install and fetch handlers registered.
  pub fn for_worker<S, T>(worker: OfflineCache<S, T>) -> Self
  where
    S: CacheStorage + 'static,
    T: Transport + 'static,
  {
    let mut dispatcher = Self::new();

    let installer = worker.clone();
    dispatcher.on(EventName::Install, move |_| {
      let worker = installer.clone();
      async move { worker.install().await.map(EventOutcome::Installed) }
    });

    dispatcher.on(EventName::Fetch, move |event| {
      let worker = worker.clone();
      async move {
        match event {
          Event::Fetch(request) => worker
            .handle_fetch(&request)
            .await
            .map(EventOutcome::Responded),
          other => Err(eyre!("Fetch handler received {} event", other.name())),
        }
      }
    });

    dispatcher
  }

  /// Register a handler, replacing any previous one for the same name.
  pub fn on<F, Fut>(&mut self, name: EventName, handler: F)
  where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<EventOutcome>> + Send + 'static,
  {
    self
      .handlers
      .insert(name, Box::new(move |event| Box::pin(handler(event))));
  }

  /// Run the handler registered for the event's name.
  ///
  /// Returns `None` when nothing is registered, leaving the default
  /// behavior to the caller.
  pub async fn dispatch(&self, event: Event) -> Result<Option<EventOutcome>> {
    let Some(handler) = self.handlers.get(&event.name()) else {
      return Ok(None);
    };
    handler(event).await.map(Some)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::net::testing::ScriptedTransport;
  use url::Url;

  fn worker() -> OfflineCache<MemoryStorage, ScriptedTransport> {
    let transport = ScriptedTransport::new()
      .respond("http://localhost:8000/", 200, "B0")
      .respond("http://localhost:8000/index.html", 200, "B1")
      .respond("http://localhost:8000/manifest.json", 200, "B2")
      .respond("http://localhost:8000/other.html", 200, "live");
    let origin = Url::parse("http://localhost:8000").unwrap();
    OfflineCache::new(MemoryStorage::new(), transport, &origin).unwrap()
  }

  #[test]
  fn test_event_names_parse() {
    assert_eq!("install".parse::<EventName>().unwrap(), EventName::Install);
    assert_eq!("fetch".parse::<EventName>().unwrap(), EventName::Fetch);
    assert!("activate".parse::<EventName>().is_err());
    assert_eq!(EventName::Fetch.to_string(), "fetch");
  }

  #[tokio::test]
  async fn test_dispatch_without_listener_returns_none() {
    let dispatcher = Dispatcher::new();
    assert!(dispatcher.dispatch(Event::Install).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_worker_handlers_route_by_name() {
    let dispatcher = Dispatcher::for_worker(worker());

    let outcome = dispatcher.dispatch(Event::Install).await.unwrap();
    assert!(matches!(outcome, Some(EventOutcome::Installed(3))));

    let hit = Request::get(Url::parse("http://localhost:8000/manifest.json").unwrap());
    match dispatcher.dispatch(Event::Fetch(hit)).await.unwrap() {
      Some(EventOutcome::Responded(result)) => {
        assert_eq!(result.source, CacheSource::Cache);
        assert_eq!(result.data.body, b"B2");
      }
      other => panic!("unexpected outcome: {:?}", other),
    }

    let miss = Request::get(Url::parse("http://localhost:8000/other.html").unwrap());
    match dispatcher.dispatch(Event::Fetch(miss)).await.unwrap() {
      Some(EventOutcome::Responded(result)) => {
        assert_eq!(result.source, CacheSource::Network);
        assert_eq!(result.data.body, b"live");
      }
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_custom_handler_replaces_default() {
    let mut dispatcher = Dispatcher::for_worker(worker());
    dispatcher.on(EventName::Install, |_| async { Ok(EventOutcome::Installed(0)) });

    let outcome = dispatcher.dispatch(Event::Install).await.unwrap();
    assert!(matches!(outcome, Some(EventOutcome::Installed(0))));
  }
}
