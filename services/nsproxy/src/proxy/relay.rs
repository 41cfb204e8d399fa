//! Bidirectional byte relay.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BUFFER_SIZE: usize = 8192;

/// Which side finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    Inbound,
    Backend,
}

/// Byte counts for one relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub to_backend: u64,
    pub from_backend: u64,
    pub ended_by: RelayEnd,
}

/// Copy bytes between `inbound` and `backend` until either side finishes.
///
/// The first direction to hit EOF or an I/O error ends the relay. Both write
/// halves are then shut down and both streams dropped, which unblocks the
/// other direction's peer.
pub async fn relay<A, B>(inbound: A, backend: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut inbound_read, mut inbound_write) = tokio::io::split(inbound);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut to_backend = 0u64;
    let mut from_backend = 0u64;

    let (ended_by, result) = tokio::select! {
        res = pump(&mut inbound_read, &mut backend_write, &mut to_backend) => (RelayEnd::Inbound, res),
        res = pump(&mut backend_read, &mut inbound_write, &mut from_backend) => (RelayEnd::Backend, res),
    };

    if let Err(e) = result {
        debug!(error = %e, ?ended_by, "Relay direction failed");
    }

    let _ = backend_write.shutdown().await;
    let _ = inbound_write.shutdown().await;

    RelayStats {
        to_backend,
        from_backend,
        ended_by,
    }
}

/// Copy `reader` into `writer` until EOF, counting bytes into `copied`.
async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
