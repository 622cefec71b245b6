//! Session relay
//!
//! A session pairs one accepted client connection with one backend connection
//! and runs two copy tasks over them: client to backend and backend to client.
//! Every chunk read in either direction goes through the session's
//! [`SessionCodec`]; only decoded client commands are reported to telemetry.
//! Forwarded bytes are always the bytes that were read.
//!
//! Client chunks pass the mapping's forwarding gate before they are written to
//! the backend. Backend chunks are never paced.
//!
//! When either copy task stops, for any reason, the session is closed: the
//! sibling task's pending read, gate wait or write is abandoned and it stops
//! too. Both connections are dropped once both tasks have returned.

use crate::config::Mapping;
use crate::pacing::Pacing;
use crate::telemetry::{CommandObservation, CommandSink};
use crate::utils::format_peer;
use log::{debug, error, info, trace};
use protocol::{Packet, SessionCodec};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Read buffer size for each direction
pub const BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client-origin traffic, paced and observed
    ClientToBackend,
    BackendToClient,
}

/// Why a copy loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Clean end of stream from the source
    EndOfStream,
    ReadError(io::ErrorKind),
    WriteError(io::ErrorKind),
    /// The destination stopped accepting bytes part way through a chunk
    ShortWrite { expected: usize, written: usize },
    /// The sibling loop closed the session
    Closed,
    /// The copy task panicked
    Panicked,
}

/// Outcome of both copy loops of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub client_to_backend: LoopExit,
    pub backend_to_client: LoopExit,
}

/// State shared by the two copy loops of one session
pub struct Session {
    server_name: String,
    client_peer: String,
    backend_peer: String,
    codec: SessionCodec,
    pacing: Arc<Pacing>,
    sink: Arc<dyn CommandSink>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        server_name: &str,
        client_peer: String,
        backend_peer: String,
        pacing: Arc<Pacing>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            client_peer,
            backend_peer,
            codec: SessionCodec::new(),
            pacing,
            sink,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Closes the session. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn endpoints(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::ClientToBackend => (&self.client_peer, &self.backend_peer),
            Direction::BackendToClient => (&self.backend_peer, &self.client_peer),
        }
    }
}

/// Dials the mapping's backend for an accepted client and relays until the
/// session ends.
///
/// Returns `None` when the backend cannot be reached; the client connection is
/// dropped without starting any copy loop.
pub async fn handle_connection(
    client: TcpStream,
    mapping: Arc<Mapping>,
    pacing: Arc<Pacing>,
    sink: Arc<dyn CommandSink>,
) -> Option<SessionSummary> {
    let backend = match TcpStream::connect(mapping.target_address.as_str()).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(
                "Could not connect to target address {}: {}",
                mapping.target_address, e
            );
            return None;
        }
    };

    let client_peer = format_peer(client.peer_addr());
    info!("New proxy started: {} -> {}", client_peer, mapping.server_name);

    let summary = relay(client, client_peer.clone(), backend, &mapping, pacing, sink).await;

    info!("Proxy closed: {} -> {}", client_peer, mapping.server_name);
    Some(summary)
}

/// Relays between an accepted client and its dialed backend.
///
/// `client_peer` is the client's printable address, used in log lines.
pub async fn relay(
    client: TcpStream,
    client_peer: String,
    backend: TcpStream,
    mapping: &Mapping,
    pacing: Arc<Pacing>,
    sink: Arc<dyn CommandSink>,
) -> SessionSummary {
    let session = Arc::new(Session::new(
        &mapping.server_name,
        client_peer,
        format_peer(backend.peer_addr()),
        pacing,
        sink,
    ));

    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let upstream = tokio::spawn(run_direction(
        client_read,
        backend_write,
        Direction::ClientToBackend,
        Arc::clone(&session),
    ));
    let downstream = tokio::spawn(run_direction(
        backend_read,
        client_write,
        Direction::BackendToClient,
        Arc::clone(&session),
    ));

    let (client_to_backend, backend_to_client) = tokio::join!(upstream, downstream);

    // A panicked loop already dropped its halves; make sure the sibling stops.
    session.close();

    SessionSummary {
        client_to_backend: task_exit(client_to_backend, Direction::ClientToBackend),
        backend_to_client: task_exit(backend_to_client, Direction::BackendToClient),
    }
}

fn task_exit(result: Result<LoopExit, JoinError>, direction: Direction) -> LoopExit {
    match result {
        Ok(exit) => exit,
        Err(e) => {
            error!("{:?} copy task failed: {}", direction, e);
            LoopExit::Panicked
        }
    }
}

/// Runs one direction and closes the session when it stops.
///
/// `reader` and `writer` are dropped on return, which closes this
/// direction's halves of both connections.
pub async fn run_direction<R, W>(
    reader: R,
    mut writer: W,
    direction: Direction,
    session: Arc<Session>,
) -> LoopExit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exit = copy_loop(reader, &mut writer, direction, &session).await;

    if session.close() {
        debug!(
            "Session {} -> {} closed by {:?} ({:?})",
            session.client_peer, session.server_name, direction, exit
        );
    }

    exit
}

async fn copy_loop<R, W>(
    mut reader: R,
    writer: &mut W,
    direction: Direction,
    session: &Session,
) -> LoopExit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (source, target) = session.endpoints(direction);
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = session.shutdown.cancelled() => return LoopExit::Closed,
            result = reader.read(&mut buf) => match result {
                Ok(0) => return LoopExit::EndOfStream,
                Ok(n) => n,
                Err(e) => {
                    error!("Could not read from {}: {}", source, e);
                    return LoopExit::ReadError(e.kind());
                }
            },
        };
        let chunk = &buf[..n];

        let packet = session.codec.decode(chunk);

        let token = match direction {
            Direction::ClientToBackend => tokio::select! {
                _ = session.shutdown.cancelled() => return LoopExit::Closed,
                token = session.pacing.acquire_forward() => Some(token),
            },
            Direction::BackendToClient => None,
        };

        let written = tokio::select! {
            _ = session.shutdown.cancelled() => None,
            result = write_chunk(writer, chunk) => Some(result),
        };

        if let Some(token) = token {
            session.pacing.release_forward(token);
        }

        match written {
            None => return LoopExit::Closed,
            Some(Ok(())) => {}
            Some(Err(WriteFailure::Io(e))) => {
                error!("Could not write to {}: {}", target, e);
                return LoopExit::WriteError(e.kind());
            }
            Some(Err(WriteFailure::Short { written })) => {
                error!(
                    "Could not write to {} (expected {} bytes, got {})",
                    target, n, written
                );
                return LoopExit::ShortWrite {
                    expected: n,
                    written,
                };
            }
        }

        debug!("{} >>> {} ({} bytes)", source, target, n);

        if direction == Direction::ClientToBackend {
            if let Packet::Command { name, arguments } = packet {
                trace!("Packet received: {} {}", name, arguments);
                session.sink.emit(CommandObservation::new(
                    &session.server_name,
                    &name,
                    &arguments,
                    n,
                ));
            }
        }
    }
}

enum WriteFailure {
    Io(io::Error),
    Short { written: usize },
}

// Writes the whole chunk. A destination that accepts zero bytes before the
// chunk is complete ends the write; the remainder is not retried.
async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> Result<(), WriteFailure>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < chunk.len() {
        match writer.write(&chunk[written..]).await {
            Ok(0) => return Err(WriteFailure::Short { written }),
            Ok(k) => written += k,
            Err(e) => return Err(WriteFailure::Io(e)),
        }
    }

    writer.flush().await.map_err(WriteFailure::Io)
}
