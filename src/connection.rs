/// Per-connection state machine.
///
/// A `Connection` owns the client socket, the backend socket once one is
/// selected, and the buffers in between. `run` walks it through its phases
/// and guarantees the pool sees exactly one `track_start`/`track_end` pair
/// for every connection that reached selection.
use crate::backend::BackendPool;
use crate::http;
use crate::server::tune_socket;
use log::{error, info};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::prelude::*;
use tokio::time;

/// Initial request buffer capacity.
pub const INITIAL_BUFFER_SIZE: usize = 1024 * 1024;

/// Request buffers double on demand up to this hard cap; a request that
/// outgrows it closes the connection as a failure.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

// Scratch size for each read while streaming.
const CHUNK_SIZE: usize = 64 * 1024;

/// Lifecycle of a proxied connection, in the order the phases are entered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    ReadingRequest,
    ConnectingBackend,
    ForwardingRequest,
    StreamingResponse,
    Draining,
    Closed,
}

/// Client-request accumulation buffer with the data plane's growth
/// discipline: start at 1 MiB, double on demand, give up at the cap.
/// `bytes_received` and `bytes_sent` are the progress indices for the
/// client-to-backend direction.
pub struct RequestBuffer {
    buf: Vec<u8>,
    max_size: usize,
    bytes_received: usize,
    bytes_sent: usize,
}

impl RequestBuffer {
    pub fn new() -> RequestBuffer {
        RequestBuffer::with_limits(INITIAL_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }

    pub fn with_limits(initial_size: usize, max_size: usize) -> RequestBuffer {
        RequestBuffer {
            buf: vec![0; initial_size],
            max_size,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    /// Make room for at least one more read, doubling the buffer if it is
    /// full. Returns false once growth would pass the cap.
    pub fn ensure_capacity(&mut self) -> bool {
        if self.bytes_received < self.buf.len() {
            return true;
        }
        let new_size = self.buf.len() * 2;
        if new_size > self.max_size {
            return false;
        }
        self.buf.resize(new_size, 0);
        true
    }

    /// Writable tail for the next client read.
    pub fn spare(&mut self) -> &mut [u8] {
        let received = self.bytes_received;
        &mut self.buf[received..]
    }

    pub fn advance(&mut self, n: usize) {
        self.bytes_received += n;
    }

    pub fn mark_sent(&mut self, n: usize) {
        self.bytes_sent += n;
    }

    /// Received-but-unforwarded request bytes.
    pub fn unsent(&self) -> &[u8] {
        &self.buf[self.bytes_sent..self.bytes_received]
    }

    pub fn received(&self) -> &[u8] {
        &self.buf[..self.bytes_received]
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

pub struct Connection {
    client: TcpStream,
    backend: Option<TcpStream>,
    request: RequestBuffer,
    /// Response bytes the client socket refused on a short write, flushed
    /// before any further response data is pulled from the backend.
    write_pending: Vec<u8>,
    write_pending_sent: usize,
    server_idx: Option<usize>,
    phase: Phase,
    start_time: Option<Instant>,
    client_addr: SocketAddr,
    client_eof: bool,
}

impl Connection {
    pub fn new(client: TcpStream, client_addr: SocketAddr) -> Connection {
        Connection {
            client,
            backend: None,
            request: RequestBuffer::new(),
            write_pending: Vec::new(),
            write_pending_sent: 0,
            server_idx: None,
            phase: Phase::ReadingRequest,
            start_time: None,
            client_addr,
            client_eof: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive the connection to completion and settle the metrics.
    ///
    /// Whatever happens inside, a connection that reached selection calls
    /// `track_end` exactly once on the way out; one that never selected a
    /// backend leaves the pool untouched.
    pub async fn run(mut self, pool: &BackendPool, connect_timeout: Duration) {
        let outcome = self.drive(pool, connect_timeout).await;
        self.phase = Phase::Closed;
        if let Some(index) = self.server_idx {
            let response_time = self
                .start_time
                .map(|started| started.elapsed().as_millis() as u64)
                .unwrap_or(0);
            pool.track_end(index, outcome.is_ok(), response_time);
        }
        if let Err(e) = outcome {
            error!("Connection from {} failed: {}", self.client_addr, e);
        }
        let _ = self.client.shutdown(Shutdown::Both);
        if let Some(backend) = &self.backend {
            let _ = backend.shutdown(Shutdown::Both);
        }
    }

    async fn drive(&mut self, pool: &BackendPool, connect_timeout: Duration) -> io::Result<()> {
        if !self.read_request().await? {
            // Client went away before sending a full head; nothing was
            // selected, nothing to account.
            return Ok(());
        }
        self.connect_backend(pool, connect_timeout).await?;
        self.pump().await
    }

    /// ReadingRequest: accumulate client bytes until the end-of-headers
    /// marker shows up.
    async fn read_request(&mut self) -> io::Result<bool> {
        loop {
            if !self.request.ensure_capacity() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "request exceeded the buffer cap",
                ));
            }
            let n = self.client.read(self.request.spare()).await?;
            if n == 0 {
                return Ok(false);
            }
            self.request.advance(n);
            if http::headers_complete(self.request.received()) {
                self.phase = Phase::ConnectingBackend;
                return Ok(true);
            }
        }
    }

    /// ConnectingBackend: pick a server, start the request clock, open the
    /// backend socket.
    async fn connect_backend(
        &mut self,
        pool: &BackendPool,
        connect_timeout: Duration,
    ) -> io::Result<()> {
        let index = pool
            .next_backend()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        pool.track_start(index);
        self.server_idx = Some(index);
        self.start_time = Some(Instant::now());

        let server = &pool[index];
        let addr = format!("{}:{}", server.address, server.port);
        let stream = match time::timeout(connect_timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Backend connection failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                error!("Backend connection to {} timed out", addr);
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "backend connect timed out",
                ));
            }
        };
        tune_socket(&stream);
        info!("Backend connection established successfully");
        self.backend = Some(stream);
        self.phase = Phase::ForwardingRequest;
        Ok(())
    }

    /// ForwardingRequest through Draining: push the buffered request to the
    /// backend, then stream the response back while relaying any further
    /// client bytes (request body past the head) to the backend.
    async fn pump(&mut self) -> io::Result<()> {
        let backend = match self.backend.as_mut() {
            Some(stream) => stream,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "no backend")),
        };

        while self.request.bytes_sent() < self.request.bytes_received() {
            let n = backend.write(self.request.unsent()).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "backend refused request bytes",
                ));
            }
            self.request.mark_sent(n);
        }
        self.phase = Phase::StreamingResponse;

        let (mut backend_read, mut backend_write) = backend.split();
        let (mut client_read, mut client_write) = self.client.split();
        let mut resp_chunk = vec![0u8; CHUNK_SIZE];
        let mut req_chunk = vec![0u8; CHUNK_SIZE];

        loop {
            // Backed-up response bytes go out before any new data is pulled
            // from the backend.
            flush_pending(
                &mut client_write,
                &mut self.write_pending,
                &mut self.write_pending_sent,
            )
            .await?;

            if self.client_eof {
                let n = backend_read.read(&mut resp_chunk).await?;
                if n == 0 {
                    break;
                }
                relay(
                    &mut client_write,
                    &resp_chunk[..n],
                    &mut self.write_pending,
                )
                .await?;
            } else {
                tokio::select! {
                    res = backend_read.read(&mut resp_chunk) => {
                        let n = res?;
                        if n == 0 {
                            break;
                        }
                        relay(
                            &mut client_write,
                            &resp_chunk[..n],
                            &mut self.write_pending,
                        )
                        .await?;
                    }
                    res = client_read.read(&mut req_chunk) => {
                        let n = res?;
                        if n == 0 {
                            // Client finished sending; half-close the
                            // request direction and keep streaming the
                            // response.
                            self.client_eof = true;
                            let _ = backend_write.shutdown().await;
                        } else {
                            backend_write.write_all(&req_chunk[..n]).await?;
                        }
                    }
                }
            }
        }

        // Backend EOF: the response is complete once the backlog is out.
        self.phase = Phase::Draining;
        flush_pending(
            &mut client_write,
            &mut self.write_pending,
            &mut self.write_pending_sent,
        )
        .await
    }
}

/// Write a response chunk to the client, parking whatever a short write
/// leaves over in the write-pending buffer.
async fn relay<W>(writer: &mut W, chunk: &[u8], pending: &mut Vec<u8>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let written = writer.write(chunk).await?;
    if written == 0 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "client refused response bytes",
        ));
    }
    if written < chunk.len() {
        pending.extend_from_slice(&chunk[written..]);
    }
    Ok(())
}

/// Flush the write-pending backlog to the client, advancing the progress
/// index one short write at a time.
async fn flush_pending<W>(writer: &mut W, pending: &mut Vec<u8>, sent: &mut usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while *sent < pending.len() {
        let n = writer.write(&pending[*sent..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "client refused pending bytes",
            ));
        }
        *sent += n;
    }
    pending.clear();
    *sent = 0;
    Ok(())
}
