//! Error types for the etcd client.

use thiserror::Error;

use crate::types::ApiError;

/// Errors returned by [`crate::Client`].
#[derive(Debug, Error)]
pub enum EtcdError {
    /// No peer endpoints were configured.
    #[error("no etcd peers configured")]
    NoPeers,

    /// A peer endpoint is not an http(s) URL.
    #[error("invalid etcd peer {peer}: expected an http:// or https:// URL")]
    InvalidPeer { peer: String },

    /// The keys API answered with an error body.
    #[error("etcd error: {0}")]
    Api(ApiError),

    /// Every peer refused or dropped the connection.
    #[error("all {tried} etcd peers unavailable (last error: {last})")]
    Unavailable { tried: usize, last: String },

    /// A non-success response without a decodable error body.
    #[error("unexpected etcd response (status={status}): {body}")]
    UnexpectedResponse { status: u16, body: String },

    /// Transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body was not valid keys API JSON.
    #[error("failed to decode etcd response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl EtcdError {
    /// The requested key does not exist.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, EtcdError::Api(api) if api.is_key_not_found())
    }

    /// The watch index fell out of the event history; callers must re-read.
    pub fn is_index_cleared(&self) -> bool {
        matches!(self, EtcdError::Api(api) if api.is_index_cleared())
    }
}
