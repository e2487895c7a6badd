/// Worker-pool scheduling mode.
///
/// A fixed set of threads consumes accepted connections from a bounded FIFO
/// queue and serves each one with a fully blocking forward: read the
/// request head, select a backend, connect, send, pump the response, close.
/// It trades the reactor's multiplexing depth for a flat per-connection
/// flow.
use crate::connection::MAX_BUFFER_SIZE;
use crate::http;
use crate::{AsyncResult, ProxyContext};
use log::{error, info};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Deepest the work queue is allowed to grow. Submissions past this point
/// are rejected and handed back, so the caller drops them and the client
/// socket closes.
pub const MAX_QUEUE_DEPTH: usize = 1024;

const READ_CHUNK_SIZE: usize = 64 * 1024;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One accepted client connection waiting for a worker.
pub struct WorkItem {
    pub stream: TcpStream,
    pub addr: SocketAddr,
}

struct QueueState {
    items: VecDeque<WorkItem>,
    shutdown: bool,
}

struct WorkQueue {
    state: Mutex<QueueState>,
    work_available: Condvar,
}

pub struct ThreadPool {
    workers: Vec<JoinHandle<()>>,
    queue: Arc<WorkQueue>,
    queue_depth: usize,
}

impl ThreadPool {
    /// Spawn `num_threads` workers over a queue bounded at
    /// `MAX_QUEUE_DEPTH`.
    pub fn new(num_threads: usize, ctx: Arc<ProxyContext>) -> ThreadPool {
        ThreadPool::with_queue_depth(num_threads, MAX_QUEUE_DEPTH, ctx)
    }

    pub fn with_queue_depth(
        num_threads: usize,
        queue_depth: usize,
        ctx: Arc<ProxyContext>,
    ) -> ThreadPool {
        let queue = Arc::new(WorkQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            work_available: Condvar::new(),
        });
        let workers = (0..num_threads)
            .map(|_| {
                let queue = queue.clone();
                let ctx = ctx.clone();
                thread::spawn(move || worker_loop(queue, ctx))
            })
            .collect();
        info!("Thread pool initialized with {} threads", num_threads);
        ThreadPool {
            workers,
            queue,
            queue_depth,
        }
    }

    /// Enqueue a connection for the next free worker.
    ///
    /// A full or shut-down queue rejects by handing the item back; dropping
    /// it closes the client socket, which is the backpressure contract.
    pub fn submit(&self, work: WorkItem) -> Result<(), WorkItem> {
        let mut state = self.queue.state.lock().unwrap();
        if state.shutdown || state.items.len() >= self.queue_depth {
            return Err(work);
        }
        state.items.push_back(work);
        self.queue.work_available.notify_one();
        Ok(())
    }

    /// Signal shutdown, wake every worker and wait for them to exit.
    /// Workers take no new items once the flag is up; whatever is still
    /// queued is dropped, closing those client sockets.
    pub fn shutdown(self) {
        {
            let mut state = self.queue.state.lock().unwrap();
            state.shutdown = true;
            self.queue.work_available.notify_all();
        }
        for worker in self.workers {
            let _ = worker.join();
        }
        let mut state = self.queue.state.lock().unwrap();
        state.items.clear();
    }
}

fn worker_loop(queue: Arc<WorkQueue>, ctx: Arc<ProxyContext>) {
    loop {
        let work = {
            let mut state = queue.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(work) = state.items.pop_front() {
                    break work;
                }
                state = queue.work_available.wait(state).unwrap();
            }
        };
        handle_connection(&ctx, work);
    }
}

/// Serve one client connection start to finish on the calling thread.
fn handle_connection(ctx: &ProxyContext, work: WorkItem) {
    let WorkItem { mut stream, addr } = work;
    let request_id = format!("REQ-{}", REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed));
    info!("[{}] New request started from IP: {}", request_id, addr.ip());

    let request = match read_request(&mut stream) {
        Ok(Some(request)) => request,
        // Client went away before sending a full head.
        Ok(None) => return,
        Err(e) => {
            error!("[{}] Failed to read request: {}", request_id, e);
            return;
        }
    };

    let index = match ctx.pool.next_backend() {
        Ok(index) => index,
        Err(e) => {
            error!("[{}] {}", request_id, e);
            return;
        }
    };
    ctx.pool.track_start(index);
    let started = Instant::now();
    let success = forward(ctx, index, &request, &mut stream, &request_id);
    ctx.pool
        .track_end(index, success, started.elapsed().as_millis() as u64);
}

/// Blocking read until the end-of-headers marker; `None` on client EOF.
fn read_request(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut request = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        request.extend_from_slice(&chunk[..n]);
        if http::headers_complete(&request) {
            return Ok(Some(request));
        }
        if request.len() > MAX_BUFFER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "request exceeded the buffer cap",
            ));
        }
    }
}

/// Forward the request to `backends[index]` and pump the response back.
/// Returns whether the whole exchange succeeded.
fn forward(
    ctx: &ProxyContext,
    index: usize,
    request: &[u8],
    client: &mut TcpStream,
    request_id: &str,
) -> bool {
    let server = &ctx.pool[index];
    let backend_addr: SocketAddr = match format!("{}:{}", server.address, server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("[{}] Invalid backend address: {}", request_id, e);
            return false;
        }
    };

    let mut backend = match TcpStream::connect_timeout(&backend_addr, ctx.connect_timeout) {
        Ok(stream) => stream,
        Err(e) => {
            error!("[{}] Backend connection failed: {}", request_id, e);
            return false;
        }
    };
    let _ = backend.set_nodelay(true);

    if let Err(e) = backend.write_all(request) {
        error!("[{}] Failed to send data to backend: {}", request_id, e);
        return false;
    }

    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut total_sent = 0usize;
    loop {
        match backend.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = client.write_all(&chunk[..n]) {
                    error!("[{}] Failed to send to client: {}", request_id, e);
                    return false;
                }
                total_sent += n;
            }
            Err(e) => {
                error!("[{}] Failed to read from backend: {}", request_id, e);
                return false;
            }
        }
    }

    let _ = backend.shutdown(Shutdown::Both);
    let _ = client.shutdown(Shutdown::Both);
    info!(
        "[{}] Request completed successfully - Sent {} bytes",
        request_id, total_sent
    );
    true
}

/// Worker-pool-mode entry: a blocking accept loop feeding the pool.
pub fn run(listener: TcpListener, ctx: Arc<ProxyContext>, num_threads: usize) -> AsyncResult<()> {
    info!(
        "Backend server pool initialized with {} servers",
        ctx.pool.len()
    );
    let pool = ThreadPool::new(num_threads, ctx);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let addr = match stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(_) => continue,
                };
                info!("New connection from {}", addr);
                let _ = stream.set_nodelay(true);
                if pool.submit(WorkItem { stream, addr }).is_err() {
                    // Rejected item drops here, closing the socket.
                    error!("Work queue full, rejecting connection from {}", addr);
                }
            }
            Err(e) => error!("Accept failed: {}", e),
        }
    }
    pool.shutdown();
    Ok(())
}
