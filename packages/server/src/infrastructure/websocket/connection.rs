//! Per-connection tasks: upgrade handshake, frame reader and frame writer.
//!
//! The tasks run on the transport's current-thread runtime and report back to
//! the context through [`ConnectionEvent`]s; only the context invokes protocol
//! callbacks.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        Message as WsMessage,
        handshake::server::{ErrorResponse, Request, Response},
    },
};

use crate::domain::{Message, NegotiationConfig, PeerInfo};

use super::handshake::{HandshakeOutcome, negotiate};

/// Upper bound for a peer to complete the upgrade handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a peer that is only going to be refused.
pub const REJECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Frame requests sent from the context to a connection's writer.
#[derive(Debug)]
pub enum Outgoing {
    Text(Message),
    Close,
}

/// Connection lifecycle reported to the context.
#[derive(Debug)]
pub enum ConnectionEvent {
    Established {
        peer: PeerInfo,
        writer: mpsc::UnboundedSender<Outgoing>,
        outcome: HandshakeOutcome,
    },
    HandshakeFailed {
        id: u64,
        addr: SocketAddr,
        /// The handshake was only run to refuse the peer.
        rejection: bool,
    },
    Received {
        id: u64,
        message: Message,
    },
    /// One text frame reached the socket.
    Delivered {
        id: u64,
    },
    Closed {
        id: u64,
        graceful: bool,
        /// Messages handed to the writer that never reached the socket.
        unsent: Vec<Message>,
    },
}

/// Drive one accepted TCP stream from handshake to close.
///
/// With `busy` set the handshake only exists to answer with a refusal, and
/// the peer gets [`REJECTION_TIMEOUT`] instead of [`HANDSHAKE_TIMEOUT`].
pub async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    config: Arc<NegotiationConfig>,
    busy: bool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let handshake_timeout = if busy {
        REJECTION_TIMEOUT
    } else {
        HANDSHAKE_TIMEOUT
    };
    let mut negotiated = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let (response, outcome) = negotiate(&config, busy, request, response)?;
        negotiated = Some(outcome);
        Ok(response)
    };

    let ws = match tokio::time::timeout(handshake_timeout, accept_hdr_async(stream, callback)).await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            tracing::warn!("Handshake with {} failed: {}", addr, e);
            let _ = events.send(ConnectionEvent::HandshakeFailed {
                id,
                addr,
                rejection: busy,
            });
            return;
        }
        Err(_) => {
            tracing::warn!(
                "Handshake with {} timed out after {:?}",
                addr,
                handshake_timeout
            );
            let _ = events.send(ConnectionEvent::HandshakeFailed {
                id,
                addr,
                rejection: busy,
            });
            return;
        }
    };

    let outcome = negotiated.unwrap_or_default();
    let peer = PeerInfo {
        id,
        addr,
        protocol: outcome.protocol.clone(),
    };
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    if events
        .send(ConnectionEvent::Established {
            peer,
            writer: writer_tx,
            outcome,
        })
        .is_err()
    {
        return;
    }

    let (sink, stream) = ws.split();
    let (stop_tx, stop_rx) = oneshot::channel();
    let writer = tokio::spawn(write_frames(
        sink,
        writer_rx,
        stop_rx,
        id,
        addr,
        events.clone(),
    ));
    let graceful = read_frames(stream, id, addr, &events).await;

    // Nothing written after the reader ended can reach the peer.
    let _ = stop_tx.send(());
    let unsent = writer.await.unwrap_or_default();

    let _ = events.send(ConnectionEvent::Closed {
        id,
        graceful,
        unsent,
    });
}

/// Forward complete text messages to the context until the stream ends.
///
/// Returns `true` if the peer's close frame was seen, i.e. the close
/// handshake completed.
async fn read_frames(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    id: u64,
    addr: SocketAddr,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> bool {
    let mut close_seen = false;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                let message = Message::new(text.as_str());
                if events
                    .send(ConnectionEvent::Received { id, message })
                    .is_err()
                {
                    break;
                }
            }
            Ok(WsMessage::Binary(data)) => {
                tracing::warn!(
                    "Dropping {} byte binary message from {}",
                    data.len(),
                    addr
                );
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::debug!("Close frame from {}: {:?}", addr, frame);
                close_seen = true;
            }
            Ok(_) => {
                // Ping/pong is handled automatically by the WebSocket protocol
            }
            Err(e) => {
                tracing::warn!("WebSocket error from {}: {}", addr, e);
                return false;
            }
        }
    }

    close_seen
}

/// Write frames requested by the context, in order, until `stop` fires or the
/// context asks for a close.
///
/// Each written text frame is reported as [`ConnectionEvent::Delivered`].
/// Returns the messages that were not written; the request channel is closed
/// before returning so later sends fail back to the context.
async fn write_frames<S>(
    mut sink: S,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    mut stop: oneshot::Receiver<()>,
    id: u64,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> Vec<Message>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut unsent = Vec::new();

    loop {
        let request = tokio::select! {
            biased;
            _ = &mut stop => None,
            request = outgoing.recv() => request,
        };
        let Some(request) = request else {
            break;
        };

        match request {
            Outgoing::Text(message) => {
                if let Err(e) = sink.send(WsMessage::text(message.as_str())).await {
                    tracing::warn!("Failed to send frame to {}: {}", addr, e);
                    unsent.push(message);
                    break;
                }
                let _ = events.send(ConnectionEvent::Delivered { id });
            }
            Outgoing::Close => {
                match sink.send(WsMessage::Close(None)).await {
                    Ok(()) => tracing::debug!("Close frame sent to {}", addr),
                    Err(e) => tracing::warn!("Failed to send close frame to {}: {}", addr, e),
                }
                break;
            }
        }
    }

    outgoing.close();
    while let Ok(request) = outgoing.try_recv() {
        if let Outgoing::Text(message) = request {
            unsent.push(message);
        }
    }
    unsent
}

#[cfg(test)]
mod tests {
    use futures_util::sink;

    use super::*;

    fn peer_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    /// Sink that records written frames.
    fn recording_sink(
        written: mpsc::UnboundedSender<WsMessage>,
    ) -> impl futures_util::Sink<WsMessage, Error = mpsc::error::SendError<WsMessage>> + Unpin {
        Box::pin(sink::unfold(written, |written, frame: WsMessage| async move {
            written.send(frame)?;
            Ok::<_, mpsc::error::SendError<WsMessage>>(written)
        }))
    }

    fn delivered(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ConnectionEvent::Delivered { id: 7 }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_written_frames_are_reported_as_delivered() {
        // テスト項目: ソケットへ書き込めたテキストフレームだけが送信済みとして報告される
        // given (前提条件):
        let (written_tx, mut written_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        outgoing_tx.send(Outgoing::Text(Message::from("hello"))).unwrap();
        outgoing_tx.send(Outgoing::Text(Message::from("world"))).unwrap();
        drop(outgoing_tx);

        // when (操作):
        let unsent = write_frames(
            recording_sink(written_tx),
            outgoing_rx,
            stop_rx,
            7,
            peer_addr(),
            events_tx,
        )
        .await;

        // then (期待する結果):
        assert!(unsent.is_empty());
        assert_eq!(written_rx.recv().await, Some(WsMessage::text("hello")));
        assert_eq!(written_rx.recv().await, Some(WsMessage::text("world")));
        assert_eq!(delivered(&mut events_rx), 2);
    }

    #[tokio::test]
    async fn test_pending_messages_are_returned_after_reader_ended() {
        // テスト項目: 読み込み側が終了した後に残っているメッセージは書き込まれずに返される
        // given (前提条件):
        let (written_tx, mut written_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        outgoing_tx.send(Outgoing::Text(Message::from("first"))).unwrap();
        outgoing_tx.send(Outgoing::Text(Message::from("second"))).unwrap();
        stop_tx.send(()).unwrap();

        // when (操作):
        let unsent = write_frames(
            recording_sink(written_tx),
            outgoing_rx,
            stop_rx,
            7,
            peer_addr(),
            events_tx,
        )
        .await;

        // then (期待する結果):
        assert_eq!(unsent, vec![Message::from("first"), Message::from("second")]);
        assert!(written_rx.try_recv().is_err());
        assert_eq!(delivered(&mut events_rx), 0);
        // 終了後の送信は失敗し、呼び出し側に返される
        assert!(outgoing_tx.send(Outgoing::Text(Message::from("late"))).is_err());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_message_and_the_rest() {
        // テスト項目: 書き込みに失敗したメッセージとそれ以降のメッセージは未送信として返される
        // given (前提条件):
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        drop(written_rx);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        outgoing_tx.send(Outgoing::Text(Message::from("lost?"))).unwrap();
        outgoing_tx.send(Outgoing::Text(Message::from("next"))).unwrap();

        // when (操作):
        let unsent = write_frames(
            recording_sink(written_tx),
            outgoing_rx,
            stop_rx,
            7,
            peer_addr(),
            events_tx,
        )
        .await;

        // then (期待する結果):
        assert_eq!(unsent, vec![Message::from("lost?"), Message::from("next")]);
        assert_eq!(delivered(&mut events_rx), 0);
    }
}
