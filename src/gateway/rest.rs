//! PostgREST client for the hosted backend.

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Response};
use serde_json::Value;
use url::Url;

use super::{Filter, GatewayError, RemoteGateway};
use crate::config::RemoteConfig;
use crate::models::Collection;

/// Gateway speaking the PostgREST dialect (`/rest/v1/<table>?field=eq.value`).
#[derive(Clone)]
pub struct RestGateway {
  client: Client,
  base_url: Url,
  api_key: String,
}

impl RestGateway {
  pub fn new(config: &RemoteConfig, api_key: String) -> Result<Self> {
    let mut base = config.url.trim_end_matches('/').to_string();
    base.push_str("/rest/v1/");
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid remote url '{}': {}", config.url, e))?;

    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      api_key,
    })
  }

  fn table_url(&self, collection: Collection, filter: &Filter) -> Result<Url, GatewayError> {
    let mut url = self
      .base_url
      .join(collection.table())
      .map_err(|e| GatewayError::Network(format!("Invalid url for {}: {}", collection, e)))?;

    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(select) = &filter.select {
      pairs.push(("select".to_string(), select.clone()));
    }
    for (field, value) in &filter.matches {
      pairs.push((field.clone(), format!("eq.{}", value)));
    }
    if let Some(order) = &filter.order {
      let direction = if order.ascending { "asc" } else { "desc" };
      pairs.push(("order".to_string(), format!("{}.{}", order.field, direction)));
    }

    // An empty serializer would still leave a trailing '?'
    if !pairs.is_empty() {
      url.query_pairs_mut().extend_pairs(pairs);
    }

    Ok(url)
  }

  fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
    self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
  }

  async fn check(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::from_status(status.as_u16(), &body))
  }
}

fn network(e: reqwest::Error) -> GatewayError {
  GatewayError::Network(e.to_string())
}

#[async_trait]
impl RemoteGateway for RestGateway {
  async fn list(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, GatewayError> {
    let url = self.table_url(collection, filter)?;
    let response = self
      .request(reqwest::Method::GET, url)
      .send()
      .await
      .map_err(network)?;

    Self::check(response)
      .await?
      .json::<Vec<Value>>()
      .await
      .map_err(|e| GatewayError::Decode(e.to_string()))
  }

  async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError> {
    let url = self.table_url(collection, &Filter::new())?;
    let response = self
      .request(reqwest::Method::POST, url)
      .header("Prefer", "return=representation")
      .json(&record)
      .send()
      .await
      .map_err(network)?;

    let rows = Self::check(response)
      .await?
      .json::<Vec<Value>>()
      .await
      .map_err(|e| GatewayError::Decode(e.to_string()))?;

    rows
      .into_iter()
      .next()
      .ok_or_else(|| GatewayError::Decode(format!("insert into {} returned no rows", collection)))
  }

  async fn delete(&self, collection: Collection, filter: &Filter) -> Result<(), GatewayError> {
    let url = self.table_url(collection, filter)?;
    let response = self
      .request(reqwest::Method::DELETE, url)
      .send()
      .await
      .map_err(network)?;

    Self::check(response).await?;
    Ok(())
  }

  async fn ping(&self) -> Result<(), GatewayError> {
    // Any HTTP response means the backend is reachable
    self
      .request(reqwest::Method::HEAD, self.base_url.clone())
      .send()
      .await
      .map(|_| ())
      .map_err(network)
  }
}
