use super::dialer::{BoxedStream, RawConnection};
use super::framing::{self, MAX_DATAGRAM_SIZE};
use crate::dns::codec;
use ferrous_upstream_domain::DomainError;
use hickory_proto::op::Message;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Random attempts before falling back to a linear scan of the ID space.
const ID_RANDOM_ATTEMPTS: usize = 64;

type ExchangeResult = Result<Message, DomainError>;

enum ConnWriter {
    Datagram(Arc<UdpSocket>),
    Stream(WriteHalf<BoxedStream>),
}

enum ConnReader {
    Datagram(Arc<UdpSocket>),
    Stream(ReadHalf<BoxedStream>),
}

impl ConnWriter {
    async fn write_frame(&mut self, payload: &[u8], server: &str) -> Result<(), DomainError> {
        match self {
            ConnWriter::Datagram(socket) => {
                let sent = socket
                    .send(payload)
                    .await
                    .map_err(|e| DomainError::TransportWriteFailed {
                        server: server.to_string(),
                        reason: e.to_string(),
                    })?;
                if sent != payload.len() {
                    return Err(DomainError::TransportWriteFailed {
                        server: server.to_string(),
                        reason: format!("short datagram write: {} of {} bytes", sent, payload.len()),
                    });
                }
                Ok(())
            }
            ConnWriter::Stream(half) => framing::write_frame(half, payload, server).await,
        }
    }
}

impl ConnReader {
    async fn read_frame(&mut self, server: &str) -> Result<Vec<u8>, DomainError> {
        match self {
            ConnReader::Datagram(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                let len = socket
                    .recv(&mut buf)
                    .await
                    .map_err(|e| DomainError::TransportReadFailed {
                        server: server.to_string(),
                        reason: e.to_string(),
                    })?;
                buf.truncate(len);
                Ok(buf)
            }
            ConnReader::Stream(half) => framing::read_frame(half, server).await,
        }
    }
}

struct PendingExchange {
    original_id: u16,
    ticket: u64,
    responder: oneshot::Sender<ExchangeResult>,
}

#[derive(Default)]
struct PendingTable {
    entries: FxHashMap<u16, PendingExchange>,
    closed: Option<DomainError>,
}

impl PendingTable {
    /// Keeps the caller's ID when it is free, otherwise picks a random free one.
    fn allocate_id(&self, preferred: u16) -> Option<u16> {
        if !self.entries.contains_key(&preferred) {
            return Some(preferred);
        }
        for _ in 0..ID_RANDOM_ATTEMPTS {
            let candidate = fastrand::u16(..);
            if !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        (0..=u16::MAX).find(|id| !self.entries.contains_key(id))
    }
}

/// One live connection to an upstream.
///
/// Queries are written by any task holding the connection; responses are
/// read by a single background task and routed to the waiting exchange by
/// wire ID. Many exchanges can be in flight at once (pipelining), and
/// responses may arrive in any order.
///
/// The reader task owns the socket lifetime: once it exits the pending
/// table is failed, both halves are dropped and the pool permit held for
/// this connection is returned.
pub struct PooledConnection {
    id: u64,
    server: Arc<str>,
    datagram: bool,
    created_at: Instant,
    last_used_ms: AtomicU64,
    in_flight: AtomicUsize,
    next_ticket: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<PendingTable>,
    writer: tokio::sync::Mutex<Option<ConnWriter>>,
    shutdown: CancellationToken,
}

impl PooledConnection {
    /// Takes ownership of a dialed connection and starts its reader task.
    ///
    /// `permit` is released when the socket is actually gone.
    pub fn spawn(
        id: u64,
        server: Arc<str>,
        raw: RawConnection,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<Self> {
        let datagram = raw.is_datagram();
        let (reader, writer) = match raw {
            RawConnection::Datagram(socket) => {
                let socket = Arc::new(socket);
                (
                    ConnReader::Datagram(Arc::clone(&socket)),
                    ConnWriter::Datagram(socket),
                )
            }
            RawConnection::Stream(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                (ConnReader::Stream(read_half), ConnWriter::Stream(write_half))
            }
        };

        let conn = Arc::new(Self {
            id,
            server,
            datagram,
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            next_ticket: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pending: Mutex::new(PendingTable::default()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(Arc::clone(&conn), reader, permit));

        debug!(
            conn_id = id,
            server = %conn.server,
            datagram = datagram,
            "Upstream connection opened"
        );

        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().entries.len()
    }

    /// Exchanges reserved on this connection by the pool.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn reserve(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_used_ms.store(elapsed, Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        let last_used = self.created_at + Duration::from_millis(self.last_used_ms.load(Ordering::Acquire));
        Instant::now().saturating_duration_since(last_used)
    }

    /// Registers the query, writes it and returns a handle to await the response.
    ///
    /// The query goes out under its own ID unless another in-flight exchange
    /// on this connection already uses it; the caller's ID is restored on the
    /// response either way.
    pub async fn send(
        self: &Arc<Self>,
        query: &Message,
        deadline: Instant,
    ) -> Result<PendingResponse, DomainError> {
        let mut payload = codec::encode(query)?;
        let original_id = query.id();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();

        let wire_id = {
            let mut table = self.lock_pending();
            if let Some(reason) = &table.closed {
                return Err(reason.clone());
            }
            let wire_id = table
                .allocate_id(original_id)
                .ok_or_else(|| DomainError::IdSpaceExhausted {
                    server: self.server.to_string(),
                })?;
            table.entries.insert(
                wire_id,
                PendingExchange {
                    original_id,
                    ticket,
                    responder,
                },
            );
            wire_id
        };

        // Owns the table entry from here on: dropping it unregisters the query.
        let handle = PendingResponse {
            conn: Arc::clone(self),
            wire_id,
            ticket,
            receiver,
            settled: false,
        };

        if wire_id != original_id {
            trace!(
                conn_id = self.id,
                original_id = original_id,
                wire_id = wire_id,
                "Query ID in use on connection, rewritten"
            );
        }
        payload[0..2].copy_from_slice(&wire_id.to_be_bytes());

        self.write_frame(&payload, deadline).await?;
        self.touch();

        Ok(handle)
    }

    async fn write_frame(&self, payload: &[u8], deadline: Instant) -> Result<(), DomainError> {
        let mut writer = tokio::time::timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| self.timeout_error())?;

        let Some(active) = writer.as_mut() else {
            return Err(self.closed_error());
        };

        match tokio::time::timeout_at(deadline, active.write_frame(payload, &self.server)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                drop(writer);
                self.close_with(e.clone());
                Err(e)
            }
            Err(_) => {
                // A partial frame may be on the wire; the stream cannot be reused.
                drop(writer);
                self.close_with(DomainError::TransportWriteFailed {
                    server: self.server.to_string(),
                    reason: "write timed out".to_string(),
                });
                Err(self.timeout_error())
            }
        }
    }

    /// Hands an inbound frame to the exchange waiting on its ID.
    ///
    /// Undecodable datagrams are dropped; an undecodable stream frame means
    /// the stream is out of sync and is returned as an error.
    fn route(&self, frame: &[u8]) -> Result<(), DomainError> {
        let decoded = codec::peek_id(frame)
            .ok_or_else(|| "frame shorter than a message ID".to_string())
            .and_then(|wire_id| {
                codec::decode(frame)
                    .map(|message| (wire_id, message))
                    .map_err(|e| e.to_string())
            });

        let (wire_id, mut message) = match decoded {
            Ok(decoded) => decoded,
            Err(reason) if self.datagram => {
                debug!(conn_id = self.id, server = %self.server, reason = %reason, "Discarding malformed datagram");
                return Ok(());
            }
            Err(reason) => {
                return Err(DomainError::MalformedFrame {
                    server: self.server.to_string(),
                    reason,
                });
            }
        };

        let pending = self.lock_pending().entries.remove(&wire_id);
        match pending {
            Some(pending) => {
                codec::set_id(&mut message, pending.original_id);
                let _ = pending.responder.send(Ok(message));
                self.touch();
            }
            None => {
                trace!(
                    conn_id = self.id,
                    wire_id = wire_id,
                    "Discarding response with no pending query"
                );
            }
        }
        Ok(())
    }

    /// Fails every pending exchange with `reason` and stops the reader.
    /// Later calls are no-ops.
    pub fn close_with(&self, reason: DomainError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<PendingExchange> = {
            let mut table = self.lock_pending();
            table.closed = Some(reason.clone());
            table.entries.drain().map(|(_, pending)| pending).collect()
        };

        let failed = drained.len();
        for pending in drained {
            let _ = pending.responder.send(Err(reason.clone()));
        }

        self.shutdown.cancel();

        debug!(
            conn_id = self.id,
            server = %self.server,
            failed_pending = failed,
            reason = %reason,
            "Upstream connection closed"
        );
    }

    pub fn close(&self) {
        self.close_with(self.closed_error());
    }

    /// Removes a pending entry unless it was already resolved or replaced.
    fn forget(&self, wire_id: u16, ticket: u64) {
        let mut table = self.lock_pending();
        if table.entries.get(&wire_id).map(|p| p.ticket) == Some(ticket) {
            table.entries.remove(&wire_id);
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeout_error(&self) -> DomainError {
        DomainError::TransportTimeout {
            server: self.server.to_string(),
        }
    }

    fn closed_error(&self) -> DomainError {
        DomainError::TransportConnectionClosed {
            server: self.server.to_string(),
        }
    }
}

async fn read_loop(
    conn: Arc<PooledConnection>,
    mut reader: ConnReader,
    permit: Option<OwnedSemaphorePermit>,
) {
    let failure = loop {
        let frame = tokio::select! {
            biased;
            _ = conn.shutdown.cancelled() => break None,
            frame = reader.read_frame(&conn.server) => frame,
        };

        match frame.and_then(|frame| conn.route(&frame)) {
            Ok(()) => {}
            Err(e) => break Some(e),
        }
    };

    if let Some(e) = failure {
        debug!(conn_id = conn.id, server = %conn.server, error = %e, "Upstream connection reader stopped");
        conn.close_with(e);
    }

    drop(reader);
    let writer = conn.writer.lock().await.take();
    drop(writer);
    drop(permit);

    trace!(conn_id = conn.id, "Upstream connection released");
}

/// Waits for the response to one sent query.
///
/// Dropping the handle before the response arrives unregisters the query,
/// so a late response is discarded instead of delivered.
pub struct PendingResponse {
    conn: Arc<PooledConnection>,
    wire_id: u16,
    ticket: u64,
    receiver: oneshot::Receiver<ExchangeResult>,
    settled: bool,
}

impl PendingResponse {
    pub fn wire_id(&self) -> u16 {
        self.wire_id
    }

    pub async fn wait(mut self, deadline: Instant) -> Result<Message, DomainError> {
        match tokio::time::timeout_at(deadline, &mut self.receiver).await {
            Ok(Ok(result)) => {
                self.settled = true;
                result
            }
            Ok(Err(_)) => {
                self.settled = true;
                Err(self.conn.closed_error())
            }
            Err(_) => Err(self.conn.timeout_error()),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.settled {
            self.conn.forget(self.wire_id, self.ticket);
        }
    }
}
