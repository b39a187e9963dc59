use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub mod persistent;

pub use persistent::{
    PersistentStream, PersistentStreamDelegate, PersistentStreamState, StreamContext, StreamTimers,
};

/// Which RPC a stream carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

/// Identifies a stream within one connection. `outbound` is relative to the
/// sender of a frame: it is set when the sender opened the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId {
    value: u32,
    outbound: bool,
}

impl StreamId {
    fn new(value: u32, outbound: bool) -> Self {
        Self { value, outbound }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// The same stream as seen from the other end of the connection.
    fn flipped(self) -> Self {
        Self {
            value: self.value,
            outbound: !self.outbound,
        }
    }
}

pub type StreamHeaders = Vec<(String, String)>;

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open { kind: StreamKind, headers: StreamHeaders },
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, kind: StreamKind, headers: StreamHeaders) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open { kind, headers },
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Moves frames between the two ends of a connection.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamTable = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

fn lock_streams(streams: &StreamTable) -> MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stream opened by the peer, as returned by [`MultiplexedConnection::accept`].
pub struct IncomingStream {
    pub kind: StreamKind,
    pub headers: StreamHeaders,
    pub stream: MultiplexedStream,
}

/// Multiplexes independent bidirectional streams over a single transport.
pub struct MultiplexedConnection {
    transport: Arc<dyn StreamTransport>,
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
    incoming_rx: Receiver<IncomingStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (incoming_tx, incoming_rx) = async_channel::unbounded();
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
        let manager = Self {
            transport: Arc::clone(&transport),
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams: Arc::clone(&streams),
            incoming_rx,
        };

        manager.start_outbound_loop(outbound_rx);
        manager.start_inbound_loop(streams, incoming_tx);
        manager
    }

    fn start_outbound_loop(&self, outbound_rx: Receiver<TransportFrame>) {
        let transport = Arc::clone(&self.transport);
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err:?}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(&self, streams: StreamTable, incoming_tx: Sender<IncomingStream>) {
        let transport = Arc::clone(&self.transport);
        let handle = self.clone_handle();
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("multiplexed inbound loop terminated: {err:?}");
                        fail_all_streams(&streams, err);
                        break;
                    }
                };
                let stream_id = frame.stream_id().flipped();
                let event = frame.kind().clone();

                if let FrameKind::Open { kind, headers } = event {
                    let (inbound_tx, inbound_rx) = async_channel::unbounded();
                    lock_streams(&streams).insert(stream_id, inbound_tx);
                    let stream = MultiplexedStream {
                        id: stream_id,
                        outbound: handle.outbound_tx.clone(),
                        inbound: inbound_rx,
                        manager: handle.clone(),
                    };
                    if incoming_tx
                        .send(IncomingStream {
                            kind,
                            headers,
                            stream,
                        })
                        .await
                        .is_err()
                    {
                        log::debug!("dropping incoming stream {}", stream_id.value());
                    }
                    continue;
                }

                let maybe_sender = lock_streams(&streams).get(&stream_id).cloned();
                let Some(sender) = maybe_sender else {
                    log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    continue;
                };
                if matches!(event, FrameKind::Close | FrameKind::Error(_)) {
                    let _ = sender.send(event).await;
                    lock_streams(&streams).remove(&stream_id);
                } else if let Err(err) = sender.send(event).await {
                    log::debug!(
                        "dropping inbound frame for closed stream {}: {:?}",
                        stream_id.value(),
                        err
                    );
                }
            }
        });
    }

    /// Opens a stream of `kind`; `headers` travel with the open frame.
    pub async fn open_stream(
        &self,
        kind: StreamKind,
        headers: StreamHeaders,
    ) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst), true);
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock_streams(&self.streams).insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, kind, headers))
            .await
            .map_err(|err| unavailable(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            manager: self.clone_handle(),
        })
    }

    /// Waits for the peer to open a stream.
    pub async fn accept(&self) -> FirestoreResult<IncomingStream> {
        self.incoming_rx
            .recv()
            .await
            .map_err(|err| internal_error(format!("connection closed: {err}")))
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

fn fail_all_streams(streams: &StreamTable, error: FirestoreError) {
    let senders: Vec<_> = lock_streams(streams).drain().map(|(_, sender)| sender).collect();
    for sender in senders {
        let _ = sender.try_send(FrameKind::Error(unavailable(error.message().to_string())));
    }
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
}

impl MultiplexedConnectionHandle {
    pub fn close_stream(&self, stream_id: StreamId) {
        if lock_streams(&self.streams).remove(&stream_id).is_some() {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue stream frame: {err}")))
    }

    /// Terminates the stream with `error` on the peer's side.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        lock_streams(&self.manager.streams).remove(&self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue error frame: {err}")))
    }

    /// Next payload; `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open { .. } => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.manager.close_stream(self.id);
        Ok(())
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

/// Pair of transports wired back to back, for tests and in-process peers.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};

    fn connected_pair() -> (MultiplexedConnection, MultiplexedConnection) {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        (
            MultiplexedConnection::new(left_transport),
            MultiplexedConnection::new(right_transport),
        )
    }

    #[tokio::test]
    async fn stream_exchange_roundtrip() {
        let (left, right) = connected_pair();

        let left_stream = left
            .open_stream(StreamKind::Listen, vec![("x-test".into(), "1".into())])
            .await
            .expect("left stream");
        let incoming = right.accept().await.expect("incoming stream");
        assert_eq!(incoming.kind, StreamKind::Listen);
        assert_eq!(incoming.headers, vec![("x-test".to_string(), "1".to_string())]);
        let right_stream = incoming.stream;

        left_stream.send(b"hello".to_vec()).await.expect("left send");
        let payload = right_stream.next().await.expect("right recv").expect("payload");
        assert_eq!(payload, b"hello");

        right_stream.send(b"world".to_vec()).await.expect("right send");
        let payload = left_stream.next().await.expect("left recv").expect("payload");
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn streams_opened_from_both_ends_do_not_collide() {
        let (left, right) = connected_pair();

        let from_left = left.open_stream(StreamKind::Listen, Vec::new()).await.unwrap();
        let from_right = right.open_stream(StreamKind::Write, Vec::new()).await.unwrap();
        let accepted_by_right = right.accept().await.unwrap().stream;
        let accepted_by_left = left.accept().await.unwrap().stream;

        from_left.send(b"a".to_vec()).await.unwrap();
        from_right.send(b"b".to_vec()).await.unwrap();
        assert_eq!(accepted_by_right.next().await.unwrap().unwrap(), b"a");
        assert_eq!(accepted_by_left.next().await.unwrap().unwrap(), b"b");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (left, right) = connected_pair();

        let left_stream = left.open_stream(StreamKind::Write, Vec::new()).await.unwrap();
        let right_stream = right.accept().await.unwrap().stream;

        left_stream.close().await.expect("left close");
        assert!(right_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn error_frame_surfaces_as_error() {
        let (left, right) = connected_pair();

        let left_stream = left.open_stream(StreamKind::Listen, Vec::new()).await.unwrap();
        let right_stream = right.accept().await.unwrap().stream;

        right_stream.fail(permission_denied("nope")).await.unwrap();
        let err = left_stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
    }
}
