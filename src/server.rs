/// Reverse proxy server loop.
///
/// Provides an async `run` function that instantiates a `Server` and listens
/// for incoming connections, serving each one on a dedicated task.
use crate::connection::Connection;
use crate::{AsyncResult, Config, ProxyContext};
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

/// Send and receive kernel buffer size applied to every proxied socket.
/// Large buffers move the throughput bottleneck off the socket layer for
/// bulk responses.
pub(crate) const SOCKET_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// Per-socket tuning applied to both sides of a proxied flow.
pub(crate) fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = stream.set_send_buffer_size(SOCKET_BUFFER_SIZE);
}

/// Server listener state. Created in the `run` call. It includes a `run`
/// method which performs the TCP listening and hands every accepted
/// connection its own task.
struct Server {
    listener: TcpListener,
    /// Shared proxy state: the backend pool with its balancing policy and
    /// metrics. Everything mutable inside is atomic, so tasks share it
    /// without a lock.
    ctx: Arc<ProxyContext>,
}

impl Server {
    /// Listen for inbound connections. For each inbound connection, spawn a
    /// task to drive it to completion; a connection failing never unwinds
    /// past its own task.
    ///
    /// # Errors
    ///
    /// Returns `Err` if accepting keeps failing past the backoff budget.
    /// This can happen for a number of reasons that resolve over time, for
    /// example when the operating system has reached its max number of
    /// sockets.
    pub async fn run(&mut self) -> AsyncResult<()> {
        loop {
            let (stream, addr) = self.accept().await?;
            info!("New connection from {}", addr);
            tune_socket(&stream);
            let handler = Handler {
                ctx: self.ctx.clone(),
            };
            tokio::spawn(async move {
                handler.handle_connection(stream, addr).await;
            });
        }
    }

    /// Accept an inbound connection.
    ///
    /// Errors are handled by backing off and retrying. An exponential
    /// backoff strategy is used: after the first failure the task waits for
    /// 1 second, doubling each time. If accepting still fails after waiting
    /// for 64 seconds, this function returns with the error.
    async fn accept(&mut self) -> AsyncResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => return Ok((socket, addr)),
                Err(err) => {
                    error!("Accept failed: {}", err);
                    if backoff > 64 {
                        // Accept has failed too many times. Return the error.
                        return Err(err.into());
                    }
                }
            }

            // Pause execution until the back off period elapses.
            time::delay_for(Duration::from_secs(backoff)).await;

            // Double the back off
            backoff *= 2;
        }
    }
}

#[derive(Clone)]
struct Handler {
    ctx: Arc<ProxyContext>,
}

impl Handler {
    /// Process a single connection to completion. Failures are logged and
    /// accounted by the connection itself; nothing propagates.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        Connection::new(stream, addr)
            .run(&self.ctx.pool, self.ctx.connect_timeout)
            .await;
    }
}

/// Run the reactor-mode proxy on an already-bound listener.
///
/// Arguments are listener, a bound `TcpListener`, and the shared
/// `ProxyContext` holding the backend pool.
pub async fn run(listener: TcpListener, ctx: Arc<ProxyContext>) -> AsyncResult<()> {
    info!(
        "Backend server pool initialized with {} servers",
        ctx.pool.len()
    );
    let mut server = Server { listener, ctx };
    server.run().await
}

/// Convenience entry point: stock configuration with the given listen port.
pub async fn run_proxy(listen_port: u16) -> AsyncResult<()> {
    let ctx = Arc::new(ProxyContext::from_config(&Config::default()));
    let addr = format!("0.0.0.0:{}", listen_port);
    let listener = TcpListener::bind(addr.as_str()).await?;
    info!("Listening on {}", addr);
    run(listener, ctx).await
}
