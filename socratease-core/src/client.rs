use std::collections::BTreeMap;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.socratease.com";

#[derive(Debug, Error)]
pub enum SocrateaseError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("unexpected record shape: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type RawRecord = serde_json::Map<String, Value>;

#[derive(Clone)]
pub struct SocrateaseClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl SocrateaseClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, SocrateaseError> {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(
        base_url: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, SocrateaseError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            api_key: api_key.into(),
        })
    }

    pub async fn list_units(
        &self,
        page_size: u32,
        updated_after: Option<&str>,
    ) -> Result<Vec<Unit>, SocrateaseError> {
        let mut query = vec![("type".to_string(), "quiz".to_string())];
        if let Some(since) = updated_after {
            query.push(("updated_after".to_string(), since.to_string()));
        }
        let items = self
            .fetch_paged("/v1/units/", &query, &["data", "quiz"], page_size)
            .await?;
        decode_records(items)
    }

    pub async fn get_unit_questions(
        &self,
        unit_id: &str,
    ) -> Result<Vec<RawRecord>, SocrateaseError> {
        let url = self.endpoint(&format!("/v1/units/{unit_id}/"))?;
        let body = self.get_json(url).await?;
        decode_records(items_at_path(body, &["data", "questions"]))
    }

    pub async fn list_unit_attempts(
        &self,
        unit_id: &str,
        page_size: u32,
        updated_after: Option<&str>,
    ) -> Result<Vec<Attempt>, SocrateaseError> {
        let mut query = vec![("unit_id".to_string(), unit_id.to_string())];
        if let Some(since) = updated_after {
            query.push(("updated_after".to_string(), since.to_string()));
        }
        let items = self
            .fetch_paged("/v1/user-progress/", &query, &["data"], page_size)
            .await?;
        decode_records(items)
    }

    pub async fn get_question_attempts(
        &self,
        user_id: &str,
        unit_id: &str,
        attempt_num: i64,
    ) -> Result<BTreeMap<String, Vec<RawRecord>>, SocrateaseError> {
        let mut url = self.endpoint("/v1/user-responses/")?;
        url.query_pairs_mut()
            .append_pair("user_id", user_id)
            .append_pair("unit_id", unit_id)
            .append_pair("attempt_num", &attempt_num.to_string());
        let body = self.get_json(url).await?;

        let Some(grouped) = value_at_path(body, &["data", "responses"]) else {
            return Ok(BTreeMap::new());
        };
        let Value::Object(grouped) = grouped else {
            warn!("expected an object under data.responses");
            return Ok(BTreeMap::new());
        };

        let mut out = BTreeMap::new();
        for (question_id, responses) in grouped {
            match responses {
                Value::Array(items) => {
                    out.insert(question_id, decode_records(items)?);
                }
                _ => warn!(%question_id, "expected a response list, skipping"),
            }
        }
        Ok(out)
    }

    async fn fetch_paged(
        &self,
        path: &str,
        query: &[(String, String)],
        data_path: &[&str],
        page_size: u32,
    ) -> Result<Vec<Value>, SocrateaseError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut all_items = Vec::new();
        loop {
            let mut url = self.endpoint(path)?;
            {
                let mut pairs = url.query_pairs_mut();
                for (name, value) in query {
                    pairs.append_pair(name, value);
                }
                pairs.append_pair("limit", &page_size.to_string());
                pairs.append_pair("offset", &offset.to_string());
            }
            let body = self.get_json(url).await?;
            let items = items_at_path(body, data_path);
            if items.is_empty() {
                break;
            }
            let count = items.len();
            all_items.extend(items);
            debug!(path, offset, count, "fetched page");
            if (count as u32) < page_size {
                break;
            }
            offset += page_size;
        }
        Ok(all_items)
    }

    async fn get_json(&self, url: Url) -> Result<Value, SocrateaseError> {
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SocrateaseError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SocrateaseError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(SocrateaseError::Api { status, body })
        }
    }
}

fn value_at_path(body: Value, path: &[&str]) -> Option<Value> {
    let mut node = body;
    for key in path.iter().copied() {
        match node {
            Value::Object(mut map) => match map.remove(key) {
                Some(next) => node = next,
                None => {
                    warn!(key, "response body is missing an expected key");
                    return None;
                }
            },
            _ => {
                warn!(key, "response body is not an object at an expected key");
                return None;
            }
        }
    }
    Some(node)
}

fn items_at_path(body: Value, path: &[&str]) -> Vec<Value> {
    match value_at_path(body, path) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(single) => {
            warn!("expected a list in the response body, wrapping a single record");
            vec![single]
        }
    }
}

fn decode_records<T: serde::de::DeserializeOwned>(
    items: Vec<Value>,
) -> Result<Vec<T>, SocrateaseError> {
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(SocrateaseError::from))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub payload: RawRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_num: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    #[serde(flatten)]
    pub payload: RawRecord,
}
