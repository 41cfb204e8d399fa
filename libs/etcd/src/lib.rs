//! # nsproxy-etcd
//!
//! A small client for the etcd v2 keys API, covering what a service
//! discovery consumer needs:
//!
//! - Recursive reads of a directory together with the store index
//!   (`X-Etcd-Index`) the read was taken at
//! - Long-poll watches (`wait=true`) resuming from a `waitIndex`
//! - Failover across the configured cluster peers
//!
//! Writes, TTL refreshes and the v3 gRPC API are not covered.

mod client;
mod error;
mod types;

pub use client::Client;
pub use error::EtcdError;
pub use types::{Action, ApiError, Node, Response, EVENT_INDEX_CLEARED, KEY_NOT_FOUND};
