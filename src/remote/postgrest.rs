//! PostgREST adapter (the REST surface Supabase exposes under `/rest/v1`).

use futures::future::BoxFuture;
use reqwest::{header, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{MutationOp, QueryRequest, RemoteDataSource};
use crate::error::RemoteError;
use crate::model::{Collection, RawRecord};

/// Remote store reached over HTTP.
#[derive(Clone)]
pub struct PostgrestSource {
  http: reqwest::Client,
  base: Url,
  api_key: String,
}

impl PostgrestSource {
  /// `base_url` is the project root, e.g. `https://xyz.supabase.co`.
  pub fn new(base_url: &str, timeout: Duration, api_key: impl Into<String>) -> Result<Self, RemoteError> {
    let mut base = Url::parse(base_url)
      .map_err(|e| RemoteError::Unknown(format!("invalid remote url {}: {}", base_url, e)))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| RemoteError::Unknown(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      http,
      base,
      api_key: api_key.into(),
    })
  }

  fn table_url(&self, collection: Collection) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("rest/v1/{}", collection.table_name()))
      .map_err(|e| RemoteError::Unknown(format!("invalid table url: {}", e)))
  }

  /// URL for a read: `select=*`, one `col=eq.value` per filter, then
  /// ordering and limit.
  pub(crate) fn query_url(&self, request: &QueryRequest) -> Result<Url, RemoteError> {
    let mut url = self.table_url(request.collection)?;
    {
      let mut pairs = url.query_pairs_mut();
      pairs.append_pair("select", "*");
      for filter in &request.filters {
        pairs.append_pair(&filter.column, &format!("eq.{}", filter.value));
      }
      if let Some(order) = &request.order_by {
        let direction = if order.ascending { "asc" } else { "desc" };
        pairs.append_pair("order", &format!("{}.{}", order.column, direction));
      }
      if let Some(limit) = request.limit {
        pairs.append_pair("limit", &limit.to_string());
      }
    }
    Ok(url)
  }

  pub(crate) fn mutation_url(&self, collection: Collection, op: &MutationOp) -> Result<Url, RemoteError> {
    let mut url = self.table_url(collection)?;
    if let MutationOp::Update { id } = op {
      url
        .query_pairs_mut()
        .append_pair("id", &format!("eq.{}", id));
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
    self
      .http
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
      .header(header::ACCEPT, "application/json")
  }

  async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Vec<Value>, RemoteError> {
    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      let err = status_error(status, &body);
      warn!(%status, error = %err, "remote request failed");
      return Err(err);
    }
    response.json::<Vec<Value>>().await.map_err(transport_error)
  }
}

impl RemoteDataSource for PostgrestSource {
  fn query(&self, request: QueryRequest) -> BoxFuture<'_, Result<Vec<RawRecord>, RemoteError>> {
    Box::pin(async move {
      let url = self.query_url(&request)?;
      debug!(%url, "remote query");
      let rows = self.send(self.request(Method::GET, url)).await?;
      rows
        .into_iter()
        .map(|row| RawRecord::from_row(request.collection, row).map_err(RemoteError::from))
        .collect()
    })
  }

  fn mutate(
    &self,
    collection: Collection,
    op: MutationOp,
    payload: Value,
  ) -> BoxFuture<'_, Result<RawRecord, RemoteError>> {
    Box::pin(async move {
      let url = self.mutation_url(collection, &op)?;
      let method = match op {
        MutationOp::Insert => Method::POST,
        MutationOp::Update { .. } => Method::PATCH,
      };
      debug!(%url, %method, "remote mutation");

      let builder = self
        .request(method, url)
        .header("Prefer", "return=representation")
        .json(&payload);
      let row = self
        .send(builder)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| match &op {
          MutationOp::Update { id } => RemoteError::NotFound(format!("{} {}", collection, id)),
          MutationOp::Insert => RemoteError::Unknown(format!("insert into {} returned no row", collection)),
        })?;
      RawRecord::from_row(collection, row).map_err(RemoteError::from)
    })
  }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
  if err.is_timeout() || err.is_connect() || err.is_request() {
    RemoteError::Network(err.to_string())
  } else {
    RemoteError::Unknown(err.to_string())
  }
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
  let detail = if body.is_empty() {
    status.to_string()
  } else {
    format!("{}: {}", status, body)
  };
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Auth(detail),
    StatusCode::NOT_FOUND => RemoteError::NotFound(detail),
    StatusCode::REQUEST_TIMEOUT | StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
      RemoteError::Network(detail)
    }
    _ => RemoteError::Unknown(detail),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::RecordId;

  fn source() -> PostgrestSource {
    PostgrestSource::new("https://demo.supabase.co", Duration::from_secs(5), "anon").unwrap()
  }

  #[test]
  fn test_query_url() {
    let request = QueryRequest::new(Collection::QualityMetrics)
      .eq("table_name", "fixtures")
      .order("last_checked", false)
      .limit(20);

    let url = source().query_url(&request).unwrap();
    assert_eq!(
      url.as_str(),
      "https://demo.supabase.co/rest/v1/data_quality_metrics?select=*&table_name=eq.fixtures&order=last_checked.desc&limit=20"
    );
  }

  #[test]
  fn test_base_path_is_kept() {
    let source = PostgrestSource::new("http://localhost:54321/project", Duration::from_secs(5), "k").unwrap();
    let url = source.query_url(&QueryRequest::new(Collection::Jobs)).unwrap();
    assert_eq!(url.as_str(), "http://localhost:54321/project/rest/v1/etl_jobs?select=*");
  }

  #[test]
  fn test_update_url_targets_one_row() {
    let op = MutationOp::Update { id: RecordId::from(12) };
    let url = source().mutation_url(Collection::Alerts, &op).unwrap();
    assert_eq!(url.as_str(), "https://demo.supabase.co/rest/v1/alerts?id=eq.12");

    let url = source().mutation_url(Collection::Jobs, &MutationOp::Insert).unwrap();
    assert_eq!(url.as_str(), "https://demo.supabase.co/rest/v1/etl_jobs");
  }

  #[test]
  fn test_user_tables_use_remote_names() {
    let url = source().query_url(&QueryRequest::new(Collection::Activities).limit(50)).unwrap();
    assert_eq!(url.as_str(), "https://demo.supabase.co/rest/v1/user_activities?select=*&limit=50");

    let op = MutationOp::Update { id: RecordId::new("u1") };
    let url = source().mutation_url(Collection::Profiles, &op).unwrap();
    assert_eq!(url.as_str(), "https://demo.supabase.co/rest/v1/user_profiles?id=eq.u1");
  }

  #[test]
  fn test_invalid_url_is_rejected() {
    assert!(PostgrestSource::new("not a url", Duration::from_secs(1), "k").is_err());
  }

  #[test]
  fn test_status_mapping() {
    assert!(matches!(status_error(StatusCode::UNAUTHORIZED, ""), RemoteError::Auth(_)));
    assert!(matches!(status_error(StatusCode::FORBIDDEN, "rls"), RemoteError::Auth(_)));
    assert!(matches!(status_error(StatusCode::NOT_FOUND, ""), RemoteError::NotFound(_)));
    assert!(matches!(status_error(StatusCode::GATEWAY_TIMEOUT, ""), RemoteError::Network(_)));
    assert!(matches!(status_error(StatusCode::CONFLICT, "dup"), RemoteError::Unknown(_)));
  }
}
