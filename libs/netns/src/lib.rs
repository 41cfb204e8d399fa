//! Network namespace entry.
//!
//! Produces TCP listeners whose accepted connections live in another
//! network namespace. The bind runs on a short-lived OS thread that joins
//! the target namespace with `setns(2)`: a socket stays in the namespace it
//! was created in, so the listener remains scoped after the thread exits and
//! no runtime worker thread ever switches namespace.

use std::fmt;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::thread;

use nix::sched::{setns, CloneFlags};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Namespace entry errors.
#[derive(Debug, Error)]
pub enum NamespaceError {
    /// Pid 0 never names a process namespace.
    #[error("invalid namespace pid: {0}")]
    InvalidPid(u32),

    /// The namespace file could not be opened.
    #[error("failed to open namespace {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `setns(2)` refused the namespace (missing CAP_SYS_ADMIN, wrong type).
    #[error("failed to enter namespace {}: {source}", .path.display())]
    Enter {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// The socket could not be bound inside the namespace.
    #[error("failed to bind {addr} in namespace {}: {source}", .path.display())]
    Bind {
        addr: SocketAddr,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The helper thread could not be started or vanished.
    #[error("namespace bind thread failed: {0}")]
    Thread(String),
}

/// Identifies the network namespace to listen in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceTarget {
    /// The network namespace of a running process.
    Pid(u32),
    /// A namespace file, e.g. a bind mount under `/var/run/netns`.
    Path(PathBuf),
}

impl NamespaceTarget {
    /// Resolve the namespace file for this target.
    pub fn path(&self) -> Result<PathBuf, NamespaceError> {
        match self {
            NamespaceTarget::Pid(0) => Err(NamespaceError::InvalidPid(0)),
            NamespaceTarget::Pid(pid) => Ok(PathBuf::from(format!("/proc/{pid}/ns/net"))),
            NamespaceTarget::Path(path) => Ok(path.clone()),
        }
    }
}

impl fmt::Display for NamespaceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceTarget::Pid(pid) => write!(f, "pid:{pid}"),
            NamespaceTarget::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Bind a TCP listener on `addr` inside the target network namespace.
///
/// Must be called from within a tokio runtime.
pub async fn listen(
    target: &NamespaceTarget,
    addr: SocketAddr,
) -> Result<TcpListener, NamespaceError> {
    let path = target.path()?;
    let (tx, rx) = oneshot::channel();

    let thread_path = path.clone();
    thread::Builder::new()
        .name("netns-bind".to_string())
        .spawn(move || {
            let _ = tx.send(bind_in_namespace(&thread_path, addr));
        })
        .map_err(|e| NamespaceError::Thread(e.to_string()))?;

    let std_listener = rx.await.map_err(|_| {
        NamespaceError::Thread("bind thread exited without a result".to_string())
    })??;

    let listener = TcpListener::from_std(std_listener).map_err(|source| NamespaceError::Bind {
        addr,
        path: path.clone(),
        source,
    })?;

    info!(
        namespace = %target,
        bind_addr = %addr,
        "Listener bound in namespace"
    );

    Ok(listener)
}

/// Runs on the helper thread; the namespace switch dies with the thread.
fn bind_in_namespace(
    path: &Path,
    addr: SocketAddr,
) -> Result<std::net::TcpListener, NamespaceError> {
    let ns = File::open(path).map_err(|source| NamespaceError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    setns(&ns, CloneFlags::CLONE_NEWNET).map_err(|source| NamespaceError::Enter {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "Entered network namespace");

    let bind_err = |source| NamespaceError::Bind {
        addr,
        path: path.to_path_buf(),
        source,
    };
    let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;

    Ok(listener)
}
