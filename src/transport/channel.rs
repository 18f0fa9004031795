//! Duplex message channel over a WebSocket or an in-memory pair
//!
//! Sends never block: messages are queued to a writer task. Inbound frames
//! arrive in order on the [`Inbox`], which yields `None` once the peer is gone.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::flag_raised;

use super::error::TransportError;

/// Message delivered by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Receiving half of a channel
pub type Inbox = mpsc::UnboundedReceiver<Inbound>;

/// Sending half of a duplex channel, shareable across tasks
pub struct Channel {
    id: Uuid,
    remote: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<watch::Sender<bool>>,
}

impl Channel {
    fn new(remote: String, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            remote,
            outbound,
            closed: Arc::new(closed),
        }
    }

    /// Drive a WebSocket with a reader and a writer task
    pub fn spawn<S>(ws_stream: WebSocketStream<S>, remote: impl Into<String>) -> (Arc<Channel>, Inbox)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel::new(remote.into(), out_tx));
        let (mut write, mut read) = ws_stream.split();

        let closed = channel.closed.clone();
        let mut closed_rx = closed.subscribe();
        let remote = channel.remote.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = out_rx.recv() => {
                        let frame = match msg {
                            Some(Outbound::Text(text)) => Message::Text(text),
                            Some(Outbound::Binary(data)) => Message::Binary(data),
                            Some(Outbound::Close) | None => break,
                        };
                        if let Err(e) = write.send(frame).await {
                            debug!("Write to {} failed: {}", remote, e);
                            break;
                        }
                    }
                    _ = flag_raised(&mut closed_rx) => break,
                }
            }
            let _ = write.close().await;
            closed.send_replace(true);
        });

        let closed = channel.closed.clone();
        let mut closed_rx = closed.subscribe();
        let remote = channel.remote.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = read.next() => {
                        let inbound = match frame {
                            Some(Ok(Message::Text(text))) => Inbound::Text(text),
                            Some(Ok(Message::Binary(data))) => Inbound::Binary(data),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("WebSocket error from {}: {}", remote, e);
                                break;
                            }
                        };
                        if in_tx.send(inbound).is_err() {
                            break;
                        }
                    }
                    _ = flag_raised(&mut closed_rx) => break,
                }
            }
            closed.send_replace(true);
        });

        (channel, in_rx)
    }

    /// Two connected in-memory channels
    pub fn pair() -> ((Arc<Channel>, Inbox), (Arc<Channel>, Inbox)) {
        let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
        let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
        let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
        let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();

        let a = Arc::new(Channel::new("memory:a".to_string(), a_out_tx));
        let b = Arc::new(Channel::new("memory:b".to_string(), b_out_tx));

        tokio::spawn(pump(a_out_rx, b_in_tx, a.closed.clone(), b.closed.clone()));
        tokio::spawn(pump(b_out_rx, a_in_tx, b.closed.clone(), a.closed.clone()));

        ((a, a_in_rx), (b, b_in_rx))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Address or label of the remote end
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.enqueue(Outbound::Text(text.into()))
    }

    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.enqueue(Outbound::Binary(data))
    }

    pub fn send_json<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let json = serde_json::to_string(message)?;
        self.send_text(json)
    }

    fn enqueue(&self, message: Outbound) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Close after everything already queued has been written
    pub fn close(&self) {
        if self.outbound.send(Outbound::Close).is_err() {
            self.closed.send_replace(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the channel is closed from either side
    pub async fn closed(&self) {
        flag_raised(&mut self.closed.subscribe()).await;
    }
}

async fn pump(
    mut from: mpsc::UnboundedReceiver<Outbound>,
    to: mpsc::UnboundedSender<Inbound>,
    local_closed: Arc<watch::Sender<bool>>,
    remote_closed: Arc<watch::Sender<bool>>,
) {
    let mut local_rx = local_closed.subscribe();
    let mut remote_rx = remote_closed.subscribe();
    loop {
        tokio::select! {
            msg = from.recv() => {
                let inbound = match msg {
                    Some(Outbound::Text(text)) => Inbound::Text(text),
                    Some(Outbound::Binary(data)) => Inbound::Binary(data),
                    Some(Outbound::Close) | None => break,
                };
                if to.send(inbound).is_err() {
                    break;
                }
            }
            _ = flag_raised(&mut local_rx) => break,
            _ = flag_raised(&mut remote_rx) => break,
        }
    }
    local_closed.send_replace(true);
    remote_closed.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let ((a, _a_inbox), (_b, mut b_inbox)) = Channel::pair();

        a.send_text("first").unwrap();
        a.send_binary(vec![1, 2, 3]).unwrap();

        assert_eq!(b_inbox.recv().await, Some(Inbound::Text("first".into())));
        assert_eq!(b_inbox.recv().await, Some(Inbound::Binary(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn test_close_propagates_to_both_ends() {
        let ((a, mut a_inbox), (b, mut b_inbox)) = Channel::pair();

        b.close();
        a.closed().await;

        assert!(a.is_closed());
        assert!(matches!(a.send_text("late"), Err(TransportError::Closed)));
        assert_eq!(b_inbox.recv().await, None);
        assert_eq!(a_inbox.recv().await, None);
    }
}
