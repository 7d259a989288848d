//! Freshness policy table.

use std::time::Duration;

use crate::model::Collection;

/// Refresh class of a query. The table below is fixed at compile time.
///
/// | class    | stale after | polled every |
/// |----------|-------------|--------------|
/// | realtime | 2s          | 5s           |
/// | etl      | 10s         | 15s          |
/// | user     | 30s         | 60s          |
/// | static   | never       | never        |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyClass {
  Realtime,
  Etl,
  User,
  Static,
}

impl PolicyClass {
  /// How long fetched data stays fresh. `None` means until invalidated.
  pub fn stale_time(self) -> Option<Duration> {
    match self {
      PolicyClass::Realtime => Some(Duration::from_secs(2)),
      PolicyClass::Etl => Some(Duration::from_secs(10)),
      PolicyClass::User => Some(Duration::from_secs(30)),
      PolicyClass::Static => None,
    }
  }

  pub fn refetch_interval(self) -> Option<Duration> {
    match self {
      PolicyClass::Realtime => Some(Duration::from_secs(5)),
      PolicyClass::Etl => Some(Duration::from_secs(15)),
      PolicyClass::User => Some(Duration::from_secs(60)),
      PolicyClass::Static => None,
    }
  }

  /// Default class for queries over a collection.
  pub fn for_collection(collection: Collection) -> Self {
    match collection {
      Collection::Alerts | Collection::QualityMetrics | Collection::SystemMetrics => {
        PolicyClass::Realtime
      }
      Collection::Jobs => PolicyClass::Etl,
      Collection::Profiles | Collection::Activities => PolicyClass::User,
      Collection::Countries | Collection::Leagues | Collection::Seasons | Collection::Fixtures => {
        PolicyClass::Static
      }
    }
  }
}

/// Per-subscription options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  pub class: PolicyClass,
  /// Disabled subscriptions observe the entry but never fetch or poll.
  pub enabled: bool,
}

impl QueryOptions {
  pub fn new(class: PolicyClass) -> Self {
    Self {
      class,
      enabled: true,
    }
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }
}

impl From<PolicyClass> for QueryOptions {
  fn from(class: PolicyClass) -> Self {
    Self::new(class)
  }
}
