//! nsproxy
//!
//! L4 TCP forwarder that listens inside a Linux network namespace and
//! spreads connections over backends announced in etcd.
//!
//! - [`registry`]: the live backend set and round-robin selection
//! - [`feed`]: keeps the registry current from a [`feed::ChangeSource`]
//! - [`etcd`]: the etcd v2 change source
//! - [`proxy`]: accept loop and byte relay

pub mod config;
pub mod etcd;
pub mod feed;
pub mod proxy;
pub mod registry;

pub use config::Config;
pub use etcd::EtcdSource;
pub use feed::{Change, ChangeSource, FeedConsumer, PayloadPolicy, Watched};
pub use proxy::{DispatchStats, Dispatcher, RelayEnd, RelayStats};
pub use registry::{
    BackendEntry, BackendRegistry, RegistryError, Snapshot, SyncReport, UpdateKind,
    UpdateOutcome, Watermark,
};
