//! Listening side of the data channel.
//!
//! Binds a port, accepts a single connection and validates its token.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::DataChannelError;
use crate::token::SessionToken;
use crate::transport::{Channel, TcpTransport};
use crate::wire::{read_token, write_verdict};
use crate::{TCP_AUTH_TIMEOUT, TCP_CONNECT_TIMEOUT};

/// What the dialing side needs to connect (shared out of band).
#[derive(Debug, Clone)]
pub struct DataChannelInfo {
    pub addr: SocketAddr,
    pub token: SessionToken,
}

/// A bound listener waiting for its one peer.
pub struct DataChannelListener {
    listener: TcpListener,
    token: SessionToken,
    cancel: CancellationToken,
    accept_timeout: Option<Duration>,
}

impl DataChannelListener {
    /// Binds `addr` and generates a fresh token.
    pub async fn bind(addr: SocketAddr, cancel: CancellationToken) -> Result<Self, DataChannelError> {
        Self::bind_with_token(addr, SessionToken::generate(), cancel).await
    }

    /// Binds `addr` with a caller-chosen token.
    pub async fn bind_with_token(
        addr: SocketAddr,
        token: SessionToken,
        cancel: CancellationToken,
    ) -> Result<Self, DataChannelError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "data channel listener bound");
        Ok(Self {
            listener,
            token,
            cancel,
            accept_timeout: Some(TCP_CONNECT_TIMEOUT),
        })
    }

    /// How long [`accept`](Self::accept) waits for a peer. `None` waits
    /// until cancelled.
    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn info(&self) -> DataChannelInfo {
        DataChannelInfo {
            addr: self.local_addr(),
            token: self.token.clone(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Accepts one connection and validates its token.
    ///
    /// The listener is dropped afterwards; one channel per session.
    pub async fn accept(self) -> Result<Channel, DataChannelError> {
        let accept = async {
            match self.accept_timeout {
                Some(t) => match tokio::time::timeout(t, self.listener.accept()).await {
                    Ok(result) => result.map_err(DataChannelError::from),
                    Err(_) => Err(DataChannelError::Timeout),
                },
                None => self.listener.accept().await.map_err(DataChannelError::from),
            }
        };

        // Wait for connection with timeout + cancellation.
        let (mut stream, addr) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = accept => result?,
        };
        info!(%addr, "data channel connection accepted");

        // Authenticate with timeout.
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = tokio::time::timeout(TCP_AUTH_TIMEOUT, read_token(&mut stream)) => {
                match result {
                    Ok(Ok(t)) => t,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        };

        if !self.token.matches_bytes(&received) {
            warn!(%addr, "data channel: invalid token");
            write_verdict(&mut stream, false).await?;
            return Err(DataChannelError::AuthFailed("invalid token".into()));
        }

        write_verdict(&mut stream, true).await?;
        info!(%addr, "data channel authenticated");
        Ok(TcpTransport::from_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AUTH_REJECTED;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn rejects_bad_token_with_response_byte() {
        let cancel = CancellationToken::new();
        let listener = DataChannelListener::bind("127.0.0.1:0".parse().unwrap(), cancel)
            .await
            .unwrap();
        let addr = listener.local_addr();
        let server_task = tokio::spawn(listener.accept());

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"00000000000000000000000000000000")
            .await
            .unwrap();

        let mut resp = [0u8; 1];
        stream.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp[0], AUTH_REJECTED);

        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn cancellation_before_connect() {
        let cancel = CancellationToken::new();
        let listener = DataChannelListener::bind("127.0.0.1:0".parse().unwrap(), cancel.clone())
            .await
            .unwrap();

        cancel.cancel();
        assert!(matches!(
            listener.accept().await,
            Err(DataChannelError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_times_out() {
        let listener = DataChannelListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .with_accept_timeout(Some(Duration::from_secs(3)));

        assert!(matches!(
            listener.accept().await,
            Err(DataChannelError::Timeout)
        ));
    }

    #[tokio::test]
    async fn fixed_token_is_advertised() {
        let token: SessionToken = "0123456789abcdef0123456789abcdef".parse().unwrap();
        let listener = DataChannelListener::bind_with_token(
            "127.0.0.1:0".parse().unwrap(),
            token.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let info = listener.info();
        assert_eq!(info.token, token);
        assert_ne!(info.addr.port(), 0);
    }
}
