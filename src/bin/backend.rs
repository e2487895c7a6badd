use log::info;
use rpx::http;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread;

/// Mock backend for manual proxy runs: answers every request with a canned
/// 200 identifying the port it serves.
fn main() -> rpx::AsyncResult<()> {
    rpx::init_logging().expect("Can't enable logging");
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(rpx::BASE_PORT);
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    info!("Mock backend listening on port {}", port);
    for stream in listener.incoming() {
        if let Ok(stream) = stream {
            thread::spawn(move || handle_connection(stream, port));
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, port: u16) {
    let mut chunk = [0u8; 64 * 1024];
    let mut request = Vec::new();
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                request.extend_from_slice(&chunk[..n]);
                if http::headers_complete(&request) {
                    break;
                }
            }
        }
    }
    let body = format!("hello from backend {}\n", port);
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.shutdown(Shutdown::Both);
}
