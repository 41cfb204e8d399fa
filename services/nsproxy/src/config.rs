//! Command-line configuration.
//!
//! Every flag can also be set through an `NSPROXY_*` environment variable.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{ArgGroup, Parser};
use nsproxy_netns::NamespaceTarget;

use crate::feed::PayloadPolicy;

/// Forward TCP connections accepted inside a network namespace to backends
/// announced in etcd.
#[derive(Debug, Clone, Parser)]
#[command(name = "nsproxy")]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("namespace")
        .required(true)
        .args(["namespace_pid", "namespace_path"])
))]
pub struct Config {
    /// Address to listen on inside the namespace: `ip:port`, `:port` for
    /// every interface, or `host:port`.
    #[arg(
        short,
        long,
        env = "NSPROXY_ADDR",
        default_value = "127.0.0.1:8080",
        value_parser = parse_listen_addr
    )]
    pub addr: SocketAddr,

    /// etcd directory holding backend announcements.
    #[arg(short, long, env = "NSPROXY_ETCD_PATH")]
    pub path: String,

    /// etcd peer URLs, comma separated.
    #[arg(
        short = 'C',
        long,
        env = "NSPROXY_ETCD_PEERS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:4001"
    )]
    pub peers: Vec<String>,

    /// Pid of a process whose network namespace to listen in.
    #[arg(long, visible_alias = "ns-pid", env = "NSPROXY_NAMESPACE_PID")]
    pub namespace_pid: Option<u32>,

    /// Path to a network namespace file (e.g. /var/run/netns/foo).
    #[arg(long, visible_alias = "ns-path", env = "NSPROXY_NAMESPACE_PATH")]
    pub namespace_path: Option<PathBuf>,

    /// Exit on a malformed backend announcement instead of skipping it.
    #[arg(long, env = "NSPROXY_STRICT_PAYLOADS")]
    pub strict_payloads: bool,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "NSPROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Checks clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().trim_matches('/').is_empty() {
            bail!("--path must name an etcd directory, got {:?}", self.path);
        }

        if self.namespace_pid == Some(0) {
            bail!("--namespace-pid must be a non-zero pid");
        }

        if self.peers.iter().all(|p| p.trim().is_empty()) {
            bail!("--peers must list at least one etcd peer");
        }

        Ok(())
    }

    /// The namespace to bind the listener in.
    pub fn namespace(&self) -> NamespaceTarget {
        match (&self.namespace_path, self.namespace_pid) {
            (Some(path), _) => NamespaceTarget::Path(path.clone()),
            (None, Some(pid)) => NamespaceTarget::Pid(pid),
            // The arg group requires one of the two.
            (None, None) => NamespaceTarget::Pid(0),
        }
    }

    /// How the feed treats malformed announcements.
    pub fn payload_policy(&self) -> PayloadPolicy {
        if self.strict_payloads {
            PayloadPolicy::Abort
        } else {
            PayloadPolicy::Reject
        }
    }
}

/// Host names resolve at startup, before entering the namespace.
fn parse_listen_addr(value: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Some(port) = value.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in listen address {value:?}"))?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    value
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve listen address {value:?}: {e}"))?
        .next()
        .ok_or_else(|| format!("listen address {value:?} resolved to nothing"))
}
