//! Raw byte relay for CONNECT tunnels

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Tunnel defaults to a five minute lifetime
pub const DEFAULT_TUNNEL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// How a tunnel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEnd {
    /// The client side reached EOF first
    ClientClosed,
    /// The upstream side reached EOF first
    UpstreamClosed,
    /// A read or write failed
    Failed,
    /// The absolute deadline passed
    DeadlineExceeded,
}

/// Relay statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelOutcome {
    /// Why the relay stopped
    pub end: TunnelEnd,
}

/// Pump bytes both ways until one side finishes or `deadline` passes.
///
/// Whichever direction ends first closes both sides.
pub async fn relay<C, U>(client: C, upstream: U, deadline: Instant) -> TunnelOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let pump = async {
        tokio::select! {
            copied = tokio::io::copy(&mut client_read, &mut upstream_write) => match copied {
                Ok(bytes) => {
                    tracing::trace!(category = "tunnel", bytes, "Client side closed");
                    TunnelEnd::ClientClosed
                }
                Err(e) => {
                    tracing::debug!(category = "tunnel", error = %e, "Client to upstream copy failed");
                    TunnelEnd::Failed
                }
            },
            copied = tokio::io::copy(&mut upstream_read, &mut client_write) => match copied {
                Ok(bytes) => {
                    tracing::trace!(category = "tunnel", bytes, "Upstream side closed");
                    TunnelEnd::UpstreamClosed
                }
                Err(e) => {
                    tracing::debug!(category = "tunnel", error = %e, "Upstream to client copy failed");
                    TunnelEnd::Failed
                }
            },
        }
    };

    let end = tokio::time::timeout_at(deadline, pump)
        .await
        .unwrap_or(TunnelEnd::DeadlineExceeded);

    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;

    TunnelOutcome { end }
}
