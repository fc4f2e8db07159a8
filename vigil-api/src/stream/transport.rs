//! Duplex client transport for stream sessions.
//!
//! A session writes [`StreamResponse`]s to a [`StreamSink`] and reads
//! [`StreamRequest`]s from a [`StreamSource`]. Whatever carries them to the
//! client (WebSocket, gRPC stream, in-process channel) implements the two
//! traits. [`channel_transport`] is the in-process implementation.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_core::{StreamRequest, StreamResponse};

use crate::error::{ApiError, ApiResult};

/// Outbound half of a client connection.
#[async_trait]
pub trait StreamSink: Send {
    async fn send(&mut self, response: StreamResponse) -> ApiResult<()>;
}

/// Inbound half of a client connection.
#[async_trait]
pub trait StreamSource: Send {
    /// Next control message. `None` means the client closed its side.
    async fn recv(&mut self) -> Option<ApiResult<StreamRequest>>;
}

/// Per-request data handed to a session.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Session token, with or without a `Bearer ` prefix.
    pub token: String,
    /// Cancelled when the caller goes away or the server shuts down.
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// ============================================================================
// IN-PROCESS TRANSPORT
// ============================================================================

/// Sink writing into a bounded channel.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamResponse>,
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn send(&mut self, response: StreamResponse) -> ApiResult<()> {
        self.tx
            .send(response)
            .await
            .map_err(|_| ApiError::stream_closed())
    }
}

/// Source reading from a bounded channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<ApiResult<StreamRequest>>,
}

#[async_trait]
impl StreamSource for ChannelSource {
    async fn recv(&mut self) -> Option<ApiResult<StreamRequest>> {
        self.rx.recv().await
    }
}

/// Client end of an in-process transport.
pub struct ClientHandle {
    requests: Option<mpsc::Sender<ApiResult<StreamRequest>>>,
    responses: mpsc::Receiver<StreamResponse>,
}

impl ClientHandle {
    /// Send a control message. Returns false once the session stopped reading.
    pub async fn send(&self, request: StreamRequest) -> bool {
        match &self.requests {
            Some(tx) => tx.send(Ok(request)).await.is_ok(),
            None => false,
        }
    }

    /// Inject a transport error into the session's inbound side.
    pub async fn fail(&self, error: ApiError) -> bool {
        match &self.requests {
            Some(tx) => tx.send(Err(error)).await.is_ok(),
            None => false,
        }
    }

    /// Close the client's sending side.
    pub fn close(&mut self) {
        self.requests = None;
    }

    pub async fn recv(&mut self) -> Option<StreamResponse> {
        self.responses.recv().await
    }

    /// Wait up to `wait` for the next response.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<StreamResponse> {
        tokio::time::timeout(wait, self.responses.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Build a connected in-process transport with `buffer` slots per direction.
pub fn channel_transport(buffer: usize) -> (ChannelSource, ChannelSink, ClientHandle) {
    let buffer = buffer.max(1);
    let (request_tx, request_rx) = mpsc::channel(buffer);
    let (response_tx, response_rx) = mpsc::channel(buffer);

    (
        ChannelSource { rx: request_rx },
        ChannelSink { tx: response_tx },
        ClientHandle {
            requests: Some(request_tx),
            responses: response_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_round_trip() -> ApiResult<()> {
        let (mut source, mut sink, mut client) = channel_transport(4);

        sink.send(StreamResponse::count(3)).await?;
        assert_eq!(client.recv().await, Some(StreamResponse::count(3)));

        assert!(client.send(StreamRequest::Ping).await);
        assert!(matches!(source.recv().await, Some(Ok(StreamRequest::Ping))));

        client.close();
        assert!(source.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_fails_after_client_drop() {
        let (_source, mut sink, client) = channel_transport(1);
        drop(client);
        let result = sink.send(StreamResponse::count(0)).await;
        assert!(matches!(result, Err(ref e) if e.code == crate::error::ErrorCode::StreamClosed));
    }

    #[test]
    fn test_request_context_cancel_is_shared() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new("Bearer abc").with_cancel(token.clone());
        token.cancel();
        assert!(ctx.cancel.is_cancelled());
    }
}
