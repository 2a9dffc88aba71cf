use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use plugbus_core::{ConnectionId, Message};

use crate::codec::RpcCodec;

/// Events flowing from connection tasks to the dispatcher.
#[derive(Debug)]
pub enum Inbound {
    Opened(ConnectionId),
    Frame(ConnectionId, Message),
    Closed(ConnectionId),
}

/// Items queued for a connection's writer.
#[derive(Debug)]
pub enum Outgoing {
    Frame(Message),
    /// Flush what is queued, then hang up.
    Close,
}

struct Connection {
    tx: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
}

/// Live connections and their bounded send queues.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection. Its token is a child of `parent`, so
    /// server shutdown tears every connection down.
    pub fn register(&self, parent: &CancellationToken) -> (ConnectionId, mpsc::Receiver<Outgoing>, CancellationToken) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let cancel = parent.child_token();
        self.connections.insert(
            id.clone(),
            Connection {
                tx,
                cancel: cancel.clone(),
            },
        );
        (id, rx, cancel)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            conn.cancel.cancel();
        }
    }

    /// Queue a frame without waiting. A full or closed queue drops the frame
    /// and only affects this connection.
    pub fn send_to(&self, id: &ConnectionId, message: Message) -> bool {
        let Some(conn) = self.connections.get(id) else {
            debug!(conn_id = %id, "send to unknown connection");
            return false;
        };
        match conn.tx.try_send(Outgoing::Frame(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %id, "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the writer to flush and hang up; if its queue is full, cut the
    /// connection immediately.
    pub fn close(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            if conn.tx.try_send(Outgoing::Close).is_err() {
                conn.cancel.cancel();
            }
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

/// Drive one TCP connection: a reader task decoding frames into `inbound`
/// and a writer task draining the send queue. Returns when either side ends.
pub async fn handle_connection(
    stream: TcpStream,
    conn_id: ConnectionId,
    mut rx: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    inbound: mpsc::Sender<Inbound>,
    max_frame_size: usize,
) {
    let (read_half, write_half) = stream.into_split();
    let mut frames_in = FramedRead::new(read_half, RpcCodec::new(max_frame_size));
    let mut frames_out = FramedWrite::new(write_half, RpcCodec::new(max_frame_size));

    let writer_cid = conn_id.clone();
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(Outgoing::Frame(message)) => {
                        if let Err(e) = frames_out.send(message).await {
                            debug!(conn_id = %writer_cid, error = %e, "write failed");
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => break,
                },
            }
        }
        trace!(conn_id = %writer_cid, "writer finished");
    });

    let reader_cid = conn_id.clone();
    let reader_cancel = cancel.clone();
    let reader_inbound = inbound.clone();
    let reader = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                frame = frames_in.next() => frame,
            };
            match frame {
                Some(Ok(message)) => {
                    if reader_inbound
                        .send(Inbound::Frame(reader_cid.clone(), message))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(conn_id = %reader_cid, error = %e, "undecodable stream, closing connection");
                    break;
                }
                None => break,
            }
        }
        trace!(conn_id = %reader_cid, "reader finished");
    });

    let (mut writer, mut reader) = (writer, reader);
    let writer_done = tokio::select! {
        _ = &mut writer => true,
        _ = &mut reader => false,
    };
    cancel.cancel();
    if writer_done {
        let _ = reader.await;
    } else {
        let _ = writer.await;
    }

    registry.unregister(&conn_id);
    debug!(conn_id = %conn_id, "connection closed");
    let _ = inbound.send(Inbound::Closed(conn_id)).await;
}
