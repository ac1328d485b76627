//! Dialing side of the data channel.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DataChannelError;
use crate::token::SessionToken;
use crate::transport::{Channel, TcpTransport};
use crate::wire::{read_verdict, write_token};
use crate::{TCP_AUTH_TIMEOUT, TCP_CONNECT_TIMEOUT};

/// Connects to a listening peer and authenticates with `token`.
pub async fn connect(
    addr: SocketAddr,
    token: &SessionToken,
    cancel: &CancellationToken,
) -> Result<Channel, DataChannelError> {
    // Connect with timeout + cancellation.
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(DataChannelError::Cancelled);
        }
        result = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
            match result {
                Ok(Ok(s)) => {
                    info!(%addr, "data channel connected");
                    s
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(DataChannelError::Timeout),
            }
        }
    };

    write_token(&mut stream, token).await?;

    let accepted = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(DataChannelError::Cancelled);
        }
        result = tokio::time::timeout(TCP_AUTH_TIMEOUT, read_verdict(&mut stream)) => {
            match result {
                Ok(Ok(a)) => a,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(DataChannelError::Timeout),
            }
        }
    };

    if !accepted {
        return Err(DataChannelError::AuthFailed("peer rejected token".into()));
    }

    info!(%addr, "data channel authenticated");
    Ok(TcpTransport::from_stream(stream))
}
