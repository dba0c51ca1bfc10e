//! Stream connection: one read loop and one writer task per peer stream.
//! Reads are framed, acknowledged with HEARTBEAT per batch, then run through discovery.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use devlink_core::{
    Action, Discovery, DispatchEvent, FrameSplitter, FramedMessage, PeerAddress, HEARTBEAT,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The one discovery/registry owner shared by every connection.
pub type SharedDiscovery = Arc<Mutex<Discovery>>;

/// Per-connection identity for log correlation; an address may reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stream read/write failure. Ends the connection; other connections are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("no open connection for {0}")]
    NoConnection(PeerAddress),
    #[error("unterminated frame of {len} bytes exceeds {max}")]
    FrameTooLong { len: usize, max: usize },
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Bytes requested per read. Any size works; fragmentation is handled by the splitter.
    pub read_buffer_size: usize,
    pub delimiter: String,
    /// Longest carry-over allowed before the connection is dropped.
    pub max_frame_len: usize,
}

/// Default cap on one unterminated frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            delimiter: devlink_core::DEFAULT_DELIMITER.to_owned(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Everything a connection shares with the rest of the host.
#[derive(Debug, Clone)]
pub struct Link {
    pub discovery: SharedDiscovery,
    pub events: mpsc::UnboundedSender<DispatchEvent>,
    pub senders: Senders,
    pub settings: Arc<ConnectionSettings>,
}

/// Cloneable send/close side of one connection. All writes go through the
/// connection's single writer task, so concurrent senders never interleave bytes.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    /// Spawn order, used to keep the newest connection per address.
    seq: u64,
    address: PeerAddress,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    close: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Queue `message` (UTF-8) as one write.
    pub fn send(&self, message: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message.as_bytes().to_vec())
            .map_err(|_| TransportError::Closed)
    }

    /// Stop the connection. Unblocks a pending read.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow()
    }
}

/// Open connections by peer address.
#[derive(Debug, Clone, Default)]
pub struct Senders {
    inner: Arc<Mutex<HashMap<PeerAddress, ConnectionHandle>>>,
    next_seq: Arc<AtomicU64>,
}

impl Senders {
    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `handle`. Of two connections for one address the one spawned
    /// later wins and the other is closed, whatever order they register in.
    pub async fn insert(&self, handle: ConnectionHandle) {
        let mut map = self.inner.lock().await;
        let superseded = map
            .get(&handle.address)
            .is_some_and(|current| current.seq > handle.seq);
        let stale = if superseded {
            handle.clone()
        } else {
            match map.insert(handle.address.clone(), handle.clone()) {
                Some(old) => old,
                None => return,
            }
        };
        drop(map);
        info!(
            address = %handle.address,
            closed = %stale.id,
            "closing superseded connection"
        );
        stale.close();
    }

    /// Remove the entry for `address` if it still belongs to connection `id`.
    pub async fn remove(&self, address: &PeerAddress, id: ConnectionId) {
        let mut map = self.inner.lock().await;
        if map.get(address).map(|h| h.id) == Some(id) {
            map.remove(address);
        }
    }

    pub async fn get(&self, address: &PeerAddress) -> Option<ConnectionHandle> {
        self.inner.lock().await.get(address).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Send application text to the device connected at `address`.
    pub async fn send_to(
        &self,
        address: &PeerAddress,
        message: &str,
    ) -> Result<(), TransportError> {
        let handle = self
            .get(address)
            .await
            .ok_or_else(|| TransportError::NoConnection(address.clone()))?;
        handle.send(message)
    }

    pub async fn close_all(&self) {
        for handle in self.inner.lock().await.values() {
            handle.close();
        }
    }
}

/// Per-connection read state.
#[derive(Debug)]
pub struct ConnectionState {
    address: PeerAddress,
    splitter: FrameSplitter,
    heartbeats: u64,
}

impl ConnectionState {
    fn new(address: PeerAddress, delimiter: &str) -> Self {
        Self {
            address,
            splitter: FrameSplitter::new(delimiter),
            heartbeats: 0,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Bytes of the unterminated frame at the time the connection ended.
    pub fn carry(&self) -> &[u8] {
        self.splitter.carry()
    }

    /// HEARTBEATs sent on this connection.
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }
}

/// Start the read loop and writer task for one peer stream. The join handle
/// resolves when the stream ends, errors, or the connection is closed; the
/// registry is never touched on exit.
pub fn spawn_connection<S>(
    stream: S,
    address: PeerAddress,
    link: Link,
) -> (
    ConnectionHandle,
    JoinHandle<Result<ConnectionState, TransportError>>,
)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = watch::channel(false);
    let handle = ConnectionHandle {
        id: ConnectionId::new(),
        seq: link.senders.next_seq(),
        address,
        outbound: outbound_tx,
        close: Arc::new(close_tx),
    };

    tokio::spawn(write_loop(
        writer,
        outbound_rx,
        handle.close.clone(),
        handle.id,
    ));
    let task = tokio::spawn(run_connection(reader, handle.clone(), close_rx, link));
    (handle, task)
}

async fn run_connection<R>(
    mut reader: R,
    handle: ConnectionHandle,
    mut close_rx: watch::Receiver<bool>,
    link: Link,
) -> Result<ConnectionState, TransportError>
where
    R: AsyncRead + Unpin,
{
    link.senders.insert(handle.clone()).await;
    info!(connection = %handle.id, address = %handle.address, "connection opened");

    let mut state = ConnectionState::new(handle.address.clone(), &link.settings.delimiter);
    let result = receive_loop(&mut reader, &handle, &mut close_rx, &link, &mut state).await;

    link.senders.remove(&handle.address, handle.id).await;
    handle.close();
    if link.senders.get(&handle.address).await.is_none() {
        link.discovery.lock().await.forget(&handle.address);
    }
    match result {
        Ok(()) | Err(TransportError::Closed) => {
            info!(
                connection = %handle.id,
                address = %handle.address,
                heartbeats = state.heartbeats,
                "connection closed"
            );
            Ok(state)
        }
        Err(e) => {
            warn!(
                connection = %handle.id,
                address = %handle.address,
                error = %e,
                "connection failed"
            );
            Err(e)
        }
    }
}

async fn receive_loop<R>(
    reader: &mut R,
    handle: &ConnectionHandle,
    close_rx: &mut watch::Receiver<bool>,
    link: &Link,
    state: &mut ConnectionState,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; link.settings.read_buffer_size.max(1)];
    loop {
        let n = tokio::select! {
            _ = close_rx.wait_for(|closed| *closed) => return Ok(()),
            read = reader.read(&mut buf) => read.map_err(TransportError::Read)?,
        };
        if n == 0 {
            return Ok(());
        }

        let mut frames = state.splitter.feed(&buf[..n]).peekable();
        if frames.peek().is_some() {
            // Ack before processing: the peer paces its next send on it.
            handle.send(HEARTBEAT)?;
            state.heartbeats += 1;
            process_batch(frames, handle, link, &state.address).await?;
        }

        let carry = state.splitter.carry().len();
        if carry > link.settings.max_frame_len {
            return Err(TransportError::FrameTooLong {
                len: carry,
                max: link.settings.max_frame_len,
            });
        }
        if carry > 0 {
            debug!(address = %state.address, carry, "holding partial frame");
        }
    }
}

async fn process_batch(
    frames: impl Iterator<Item = String>,
    handle: &ConnectionHandle,
    link: &Link,
    address: &PeerAddress,
) -> Result<(), TransportError> {
    let mut discovery = link.discovery.lock().await;
    for payload in frames {
        let message = FramedMessage {
            address: address.clone(),
            payload,
        };
        debug!(address = %message.address, payload = %message.payload, "frame");
        match discovery.handle(&message) {
            Some(Action::Reply(token)) => handle.send(token)?,
            Some(Action::Dispatch(event)) => {
                if link.events.send(event).is_err() {
                    warn!(address = %message.address, "dispatcher gone, dropping event");
                }
            }
            None => {}
        }
    }
    Ok(())
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    close: Arc<watch::Sender<bool>>,
    id: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = close.subscribe();
    loop {
        let bytes = tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(b) => b,
                None => break,
            },
            _ = closed.wait_for(|c| *c) => break,
        };
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(connection = %id, error = %TransportError::Write(e), "closing connection");
            close.send_replace(true);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_core::{DeviceRegistry, DiscoveryState};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_link(registry: DeviceRegistry) -> (Link, mpsc::UnboundedReceiver<DispatchEvent>) {
        link_with(registry, ConnectionSettings::default())
    }

    fn link_with(
        registry: DeviceRegistry,
        settings: ConnectionSettings,
    ) -> (Link, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Link {
            discovery: Arc::new(Mutex::new(Discovery::with_registry(registry))),
            events,
            senders: Senders::default(),
            settings: Arc::new(settings),
        };
        (link, rx)
    }

    fn detached_handle(address: &PeerAddress, seq: u64) -> ConnectionHandle {
        let (outbound, _rx) = mpsc::unbounded_channel();
        let (close, _) = watch::channel(false);
        ConnectionHandle {
            id: ConnectionId::new(),
            seq,
            address: address.clone(),
            outbound,
            close: Arc::new(close),
        }
    }

    async fn read_text(client: &mut DuplexStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        timeout(WAIT, client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<DispatchEvent>) -> DispatchEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn fragmented_discovery_over_stream() {
        let (link, mut rx) = test_link(DeviceRegistry::new());
        let discovery = link.discovery.clone();
        let (mut client, server) = tokio::io::duplex(1024);
        let address = PeerAddress::new("AA:BB");
        let (_handle, task) = spawn_connection(server, address.clone(), link);

        client.write_all(b"1000,DEVICE_INFO,NameA|200").await.unwrap();
        assert_eq!(read_text(&mut client, 9).await, "HEARTBEAT");
        let id = match next_event(&mut rx).await {
            DispatchEvent::CreateDevice {
                id,
                address: a,
                info_message,
            } => {
                assert_eq!(a, address);
                assert_eq!(info_message, "1000,DEVICE_INFO,NameA");
                id
            }
            other => panic!("expected CreateDevice, got {other:?}"),
        };
        discovery
            .lock()
            .await
            .acknowledge_created(id, &address)
            .unwrap();

        client.write_all(b"0,30|1300,PING|").await.unwrap();
        assert_eq!(read_text(&mut client, 9).await, "HEARTBEAT");
        for expected in ["2000,30", "1300,PING"] {
            match next_event(&mut rx).await {
                DispatchEvent::Deliver { device, payload, .. } => {
                    assert_eq!(device, id);
                    assert_eq!(payload, expected);
                }
                other => panic!("expected Deliver, got {other:?}"),
            }
        }

        drop(client);
        let state = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(state.heartbeats(), 2);
        assert!(state.carry().is_empty());
        assert_eq!(state.address(), &address);
    }

    #[tokio::test]
    async fn unregistered_traffic_requests_info() {
        let (link, mut rx) = test_link(DeviceRegistry::new());
        let (mut client, server) = tokio::io::duplex(1024);
        let (_handle, _task) = spawn_connection(server, PeerAddress::new("CC"), link);

        // Partial frame: no ack until the delimiter arrives.
        client.write_all(b"5,PI").await.unwrap();
        client.write_all(b"NG|").await.unwrap();
        assert_eq!(read_text(&mut client, 18).await, "HEARTBEATWHOAREYOU");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_heartbeat_per_batch() {
        let (link, _rx) = test_link(DeviceRegistry::new());
        let (mut client, server) = tokio::io::duplex(1024);
        let (_handle, _task) = spawn_connection(server, PeerAddress::new("CC"), link);

        client.write_all(b"1,A|2,B|3,C|").await.unwrap();
        assert_eq!(
            read_text(&mut client, 9 + 3 * 9).await,
            "HEARTBEATWHOAREYOUWHOAREYOUWHOAREYOU"
        );
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (link, _rx) = test_link(DeviceRegistry::new());
        let senders = link.senders.clone();
        let (mut client, server) = tokio::io::duplex(1024);
        let address = PeerAddress::new("DD");
        let (handle, task) = spawn_connection(server, address.clone(), link);

        client.write_all(b"1,PI").await.unwrap();
        tokio::task::yield_now().await;
        handle.close();
        let state = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(state.heartbeats(), 0);
        assert!(senders.get(&address).await.is_none());
        assert!(matches!(handle.send("x"), Err(TransportError::Closed)));

        // Writer shut down: peer sees EOF.
        let mut buf = [0u8; 8];
        let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn send_to_routes_by_address() {
        let (link, _rx) = test_link(DeviceRegistry::new());
        let senders = link.senders.clone();
        let (mut client, server) = tokio::io::duplex(1024);
        let address = PeerAddress::new("EE");
        let (handle, _task) = spawn_connection(server, address.clone(), link);

        timeout(WAIT, async {
            while senders.get(&address).await.is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        senders.send_to(&address, "42,VIBRATE").await.unwrap();
        handle.send("|43,VIBRATE").unwrap();
        assert_eq!(read_text(&mut client, 21).await, "42,VIBRATE|43,VIBRATE");

        assert!(matches!(
            senders.send_to(&PeerAddress::new("FF"), "x").await,
            Err(TransportError::NoConnection(_))
        ));
    }

    #[tokio::test]
    async fn reconnect_replaces_old_connection() {
        let (link, _rx) = test_link(DeviceRegistry::new());
        let senders = link.senders.clone();
        let address = PeerAddress::new("AA");

        let (_c1, s1) = tokio::io::duplex(64);
        let (first, first_task) = spawn_connection(s1, address.clone(), link.clone());
        timeout(WAIT, async {
            while senders.get(&address).await.is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (_c2, s2) = tokio::io::duplex(64);
        let (second, _second_task) = spawn_connection(s2, address.clone(), link);
        timeout(WAIT, first_task).await.unwrap().unwrap().unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(senders.get(&address).await.map(|h| h.id()), Some(second.id()));
        assert_eq!(senders.len().await, 1);
    }

    #[tokio::test]
    async fn oversized_frame_ends_connection() {
        let settings = ConnectionSettings {
            max_frame_len: 8,
            ..ConnectionSettings::default()
        };
        let (link, _rx) = link_with(DeviceRegistry::new(), settings);
        let (mut client, server) = tokio::io::duplex(1024);
        let (handle, task) = spawn_connection(server, PeerAddress::new("GG"), link);

        client.write_all(b"1,PI").await.unwrap();
        client.write_all(b"NG-without-end").await.unwrap();
        let result = timeout(WAIT, task).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(TransportError::FrameTooLong { max: 8, .. })
        ));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn failing_connection_leaves_others_running() {
        let settings = ConnectionSettings {
            max_frame_len: 24,
            ..ConnectionSettings::default()
        };
        let (link, mut rx) = link_with(DeviceRegistry::new(), settings);
        let discovery = link.discovery.clone();
        let senders = link.senders.clone();
        let a = PeerAddress::new("AA");
        let b = PeerAddress::new("BB");
        let (mut client_a, server_a) = tokio::io::duplex(1024);
        let (mut client_b, server_b) = tokio::io::duplex(1024);
        let (_handle_a, task_a) = spawn_connection(server_a, a.clone(), link.clone());
        let (handle_b, _task_b) = spawn_connection(server_b, b.clone(), link);

        client_a.write_all(b"1,PING|").await.unwrap();
        assert_eq!(read_text(&mut client_a, 18).await, "HEARTBEATWHOAREYOU");
        client_b.write_all(b"1,DEVICE_INFO,Phone|").await.unwrap();
        assert_eq!(read_text(&mut client_b, 9).await, "HEARTBEAT");
        let id = match next_event(&mut rx).await {
            DispatchEvent::CreateDevice { id, address, .. } => {
                assert_eq!(address, b);
                id
            }
            other => panic!("expected CreateDevice, got {other:?}"),
        };

        // A never terminates its next frame and is dropped mid-handshake.
        client_a.write_all(&[b'x'; 64]).await.unwrap();
        let result = timeout(WAIT, task_a).await.unwrap().unwrap();
        assert!(matches!(result, Err(TransportError::FrameTooLong { .. })));

        discovery.lock().await.acknowledge_created(id, &b).unwrap();
        client_b.write_all(b"2,TAP|").await.unwrap();
        assert_eq!(read_text(&mut client_b, 9).await, "HEARTBEAT");
        match next_event(&mut rx).await {
            DispatchEvent::Deliver { device, payload, .. } => {
                assert_eq!(device, id);
                assert_eq!(payload, "2,TAP");
            }
            other => panic!("expected Deliver, got {other:?}"),
        }

        assert!(!handle_b.is_closed());
        assert!(senders.get(&a).await.is_none());
        assert_eq!(senders.get(&b).await.map(|h| h.id()), Some(handle_b.id()));
        let d = discovery.lock().await;
        assert_eq!(d.state(&a), DiscoveryState::Unknown);
        assert_eq!(d.state(&b), DiscoveryState::Registered);
        assert_eq!(d.registry().len(), 1);
        assert_eq!(d.registry().lookup_by_address(&b).and_then(|r| r.id()), Some(id));
    }

    #[tokio::test]
    async fn older_connection_registering_late_is_closed() {
        let senders = Senders::default();
        let address = PeerAddress::new("AA");
        let older = detached_handle(&address, 0);
        let newer = detached_handle(&address, 1);

        senders.insert(newer.clone()).await;
        senders.insert(older.clone()).await;
        assert!(older.is_closed());
        assert!(!newer.is_closed());
        assert_eq!(senders.get(&address).await.map(|h| h.id()), Some(newer.id()));
        assert_eq!(senders.len().await, 1);
    }
}
