//! HTTP client for the v2 keys API.

use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::error::EtcdError;
use crate::types::{ApiError, Response};

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// etcd v2 client with ordered peer failover.
///
/// Requests go to the first peer; a peer that cannot be connected to is
/// skipped in favour of the next one. No request timeout is set, since
/// watches block until the store changes.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    peers: Vec<String>,
}

/// Index header and body of a successful keys API exchange.
struct RawResponse {
    etcd_index: Option<u64>,
    body: String,
}

impl Client {
    /// Create a client for the given peer URLs (e.g. `http://127.0.0.1:4001`).
    pub fn new<I, S>(peers: I) -> Result<Self, EtcdError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers: Vec<String> = peers
            .into_iter()
            .map(|p| p.as_ref().trim().trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();

        if peers.is_empty() {
            return Err(EtcdError::NoPeers);
        }

        if let Some(bad) = peers
            .iter()
            .find(|p| !(p.starts_with("http://") || p.starts_with("https://")))
        {
            return Err(EtcdError::InvalidPeer { peer: bad.clone() });
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("nsproxy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, peers })
    }

    /// Configured peers, in failover order.
    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Read a key or directory.
    ///
    /// The returned response carries the store index the read was served
    /// at, which is the point a follow-up watch should resume after.
    pub async fn get(&self, key: &str, recursive: bool) -> Result<Response, EtcdError> {
        let query = [("recursive", recursive.to_string())];
        let raw = self.request(key, &query).await?;

        let mut response: Response = serde_json::from_str(&raw.body)?;
        response.etcd_index = raw.etcd_index;
        Ok(response)
    }

    /// Block until a change at or after `wait_index` under `key` (recursively).
    ///
    /// Returns `Ok(None)` when the server closes the long-poll without an
    /// event; callers should simply watch again from the same index.
    pub async fn watch(
        &self,
        key: &str,
        wait_index: u64,
    ) -> Result<Option<Response>, EtcdError> {
        let query = [
            ("wait", "true".to_string()),
            ("recursive", "true".to_string()),
            ("waitIndex", wait_index.to_string()),
        ];
        let raw = self.request(key, &query).await?;

        if raw.body.trim().is_empty() {
            debug!(key, wait_index, "Watch returned without an event");
            return Ok(None);
        }

        let mut response: Response = serde_json::from_str(&raw.body)?;
        response.etcd_index = raw.etcd_index;
        Ok(Some(response))
    }

    async fn request(
        &self,
        key: &str,
        query: &[(&str, String)],
    ) -> Result<RawResponse, EtcdError> {
        let path = key_path(key);
        let mut last_error = String::new();

        for peer in &self.peers {
            let url = format!("{peer}/v2/keys{path}");
            match self.http.get(&url).query(query).send().await {
                Ok(resp) => return read_response(resp).await,
                Err(e) if e.is_connect() => {
                    warn!(peer = %peer, error = %e, "etcd peer unreachable, trying next");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EtcdError::Unavailable {
            tried: self.peers.len(),
            last: last_error,
        })
    }
}

async fn read_response(resp: reqwest::Response) -> Result<RawResponse, EtcdError> {
    let status = resp.status();
    let etcd_index = etcd_index(resp.headers());
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<ApiError>(&body) {
            Ok(api) => EtcdError::Api(api),
            Err(_) => EtcdError::UnexpectedResponse {
                status: status.as_u16(),
                body,
            },
        });
    }

    Ok(RawResponse { etcd_index, body })
}

fn etcd_index(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(ETCD_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Normalize a key into the path segment after `/v2/keys`.
fn key_path(key: &str) -> String {
    format!("/{}", key.trim_matches('/'))
}
