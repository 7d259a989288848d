//! Access to the remote store the dashboard reads from and writes to.

mod memory;
mod postgrest;

pub use memory::MemorySource;
pub use postgrest::PostgrestSource;

use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;

use crate::error::RemoteError;
use crate::model::{Collection, RawRecord, RecordId};

/// Equality filter on one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
  pub column: String,
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
  pub column: String,
  pub ascending: bool,
}

/// A read against one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
  pub collection: Collection,
  pub filters: Vec<Filter>,
  pub order_by: Option<OrderBy>,
  pub limit: Option<usize>,
}

impl QueryRequest {
  pub fn new(collection: Collection) -> Self {
    Self {
      collection,
      filters: Vec::new(),
      order_by: None,
      limit: None,
    }
  }

  pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
    self.filters.push(Filter {
      column: column.into(),
      value: value.to_string(),
    });
    self
  }

  pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
    self.order_by = Some(OrderBy {
      column: column.into(),
      ascending,
    });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
  Insert,
  Update { id: RecordId },
}

/// Query and mutation interface of the remote store.
///
/// Implementations own transport and authentication. Both calls are
/// fallible; a call that takes too long must fail rather than hang, see
/// [`WithTimeout`].
pub trait RemoteDataSource: Send + Sync {
  /// Rows of a collection, in the order the request asks for.
  fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<Vec<RawRecord>, RemoteError>>;

  /// Insert or update one record and return it as stored.
  fn mutate(
    &self,
    collection: Collection,
    op: MutationOp,
    payload: Value,
  ) -> BoxFuture<'_, Result<RawRecord, RemoteError>>;
}

/// Bounds every call of the wrapped source by a timeout.
///
/// A timed-out call fails with [`RemoteError::Network`].
pub struct WithTimeout<S> {
  inner: S,
  timeout: Duration,
}

impl<S> WithTimeout<S> {
  pub fn new(inner: S, timeout: Duration) -> Self {
    Self { inner, timeout }
  }

  pub fn inner(&self) -> &S {
    &self.inner
  }
}

impl<S: RemoteDataSource> RemoteDataSource for WithTimeout<S> {
  fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<Vec<RawRecord>, RemoteError>> {
    Box::pin(async move {
      match tokio::time::timeout(self.timeout, self.inner.query(request)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::timeout(self.timeout)),
      }
    })
  }

  fn mutate(
    &self,
    collection: Collection,
    op: MutationOp,
    payload: Value,
  ) -> BoxFuture<'_, Result<RawRecord, RemoteError>> {
    Box::pin(async move {
      match tokio::time::timeout(self.timeout, self.inner.mutate(collection, op, payload)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::timeout(self.timeout)),
      }
    })
  }
}
