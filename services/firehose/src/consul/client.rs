//! Consul HTTP API client.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{KvEntry, KvError, KvRead, KvStore};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// KV store client over the Consul HTTP API.
pub struct ConsulClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    modify_index: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

impl ConsulClient {
    /// Create a new client.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, KvError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(token.trim())
                .map_err(|_| KvError::InvalidToken)?;
            headers.insert(TOKEN_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .user_agent("allocation-firehose/0.1.0")
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(15 * 60))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'))
    }

    async fn read(&self, key: &str, blocking: Option<(u64, Duration)>) -> Result<KvRead, KvError> {
        let mut request = self.client.get(self.kv_url(key));
        if let Some((index, wait)) = blocking {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", wait.as_secs().max(1))),
            ]);
        }

        let response = request.send().await?;
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(KvRead { entry: None, index });
        }

        let response = ensure_success(response).await?;
        let pairs: Vec<KvPair> = response
            .json()
            .await
            .map_err(|e| KvError::InvalidResponse(e.to_string()))?;

        let entry = match pairs.into_iter().next() {
            Some(pair) => Some(decode_pair(pair)?),
            None => None,
        };

        Ok(KvRead { entry, index })
    }

    async fn put_bool(
        &self,
        url: String,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<bool, KvError> {
        let response = self.client.put(url).query(query).body(body).send().await?;
        let response = ensure_success(response).await?;
        let text = response.text().await?;
        Ok(text.trim() == "true")
    }
}

fn decode_pair(pair: KvPair) -> Result<KvEntry, KvError> {
    let value = match pair.value {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| KvError::InvalidResponse(format!("value of {}: {e}", pair.key)))?,
        None => Vec::new(),
    };

    Ok(KvEntry {
        key: pair.key,
        value,
        session: pair.session.filter(|s| !s.is_empty()),
        modify_index: pair.modify_index,
    })
}

async fn ensure_success(response: Response) -> Result<Response, KvError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(KvError::Status { status, body })
}

#[async_trait]
impl KvStore for ConsulClient {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, KvError> {
        Ok(self.read(key, None).await?.entry)
    }

    async fn get_blocking(
        &self,
        key: &str,
        index: u64,
        wait: Duration,
    ) -> Result<KvRead, KvError> {
        self.read(key, Some((index, wait))).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        if !self.put_bool(self.kv_url(key), &[], value.to_vec()).await? {
            return Err(KvError::InvalidResponse(format!("write of {key} was not applied")));
        }
        Ok(())
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &str) -> Result<bool, KvError> {
        match self
            .put_bool(self.kv_url(key), &[("acquire", session)], value.to_vec())
            .await
        {
            Err(KvError::Status { status: 500, body }) if body.contains("invalid session") => {
                Err(KvError::InvalidSession(session.to_string()))
            }
            other => other,
        }
    }

    async fn release(&self, key: &str, session: &str) -> Result<bool, KvError> {
        self.put_bool(self.kv_url(key), &[("release", session)], Vec::new())
            .await
    }

    async fn create_session(&self, name: &str, ttl: Duration) -> Result<String, KvError> {
        let request = SessionRequest {
            name,
            ttl: format!("{}s", ttl.as_secs()),
            behavior: "release",
        };

        let response = self
            .client
            .put(format!("{}/v1/session/create", self.base_url))
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| KvError::InvalidResponse(e.to_string()))?;

        debug!(session_id = %created.id, ttl_secs = ttl.as_secs(), "Created session");
        Ok(created.id)
    }

    async fn renew_session(&self, session: &str) -> Result<bool, KvError> {
        let response = self
            .client
            .put(format!("{}/v1/session/renew/{}", self.base_url, session))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response).await?;
        Ok(true)
    }

    async fn destroy_session(&self, session: &str) -> Result<(), KvError> {
        let response = self
            .client
            .put(format!("{}/v1/session/destroy/{}", self.base_url, session))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}
