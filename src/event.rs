use dashsync::cache::CacheEntry;
use dashsync::Subscription;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Summary panel a cache update belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
  Jobs,
  Quality,
  Alerts,
  Health,
}

/// Application events
#[derive(Debug)]
pub enum Event {
  /// A watched cache entry changed
  Updated(Panel, Box<CacheEntry>),
  /// Periodic tick for the status line
  Tick,
  /// Ctrl-C
  Quit,
}

/// Merges subscription updates, a tick timer and Ctrl-C into one stream.
///
/// Dropping the handler stops every task feeding it, which releases the
/// watched subscriptions.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
  tasks: Vec<JoinHandle<()>>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    let tick = tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    let quit_tx = tx.clone();
    let quit = tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = quit_tx.send(Event::Quit);
      }
    });

    Self {
      tx,
      rx,
      tasks: vec![tick, quit],
    }
  }

  /// Forward every change of `subscription` as an [`Event::Updated`].
  ///
  /// The subscription lives in the forwarding task until the handler is
  /// dropped.
  pub fn watch(&mut self, panel: Panel, mut subscription: Subscription) {
    let tx = self.tx.clone();
    let forward = tokio::spawn(async move {
      if tx.send(Event::Updated(panel, Box::new(subscription.entry()))).is_err() {
        return;
      }
      while let Some(entry) = subscription.changed().await {
        if tx.send(Event::Updated(panel, Box::new(entry))).is_err() {
          break;
        }
      }
    });
    self.tasks.push(forward);
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Drop for EventHandler {
  fn drop(&mut self) {
    for task in self.tasks.drain(..) {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use dashsync::cache::QueryKey;
  use dashsync::model::Collection;
  use dashsync::{Dashboard, MemorySource, QueryCache};
  use std::sync::Arc;
  use tokio::time;

  #[tokio::test(start_paused = true)]
  async fn test_dropping_handler_releases_watched_subscriptions() {
    let cache = QueryCache::new();
    let dashboard = Dashboard::new(cache.clone(), Arc::new(MemorySource::demo(Utc::now())));
    let key = QueryKey::summary(Collection::Alerts);

    let mut events = EventHandler::new(Duration::from_secs(1));
    events.watch(Panel::Alerts, dashboard.alert_summary());
    assert!(matches!(events.next().await, Some(Event::Updated(Panel::Alerts, _))));
    assert_eq!(cache.subscriber_count(&key), 1);
    assert!(cache.is_polling(&key));

    drop(events);
    time::sleep(Duration::from_millis(1)).await;
    assert_eq!(cache.subscriber_count(&key), 0);
    assert!(!cache.is_polling(&key));
  }
}
