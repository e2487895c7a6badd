/// HTTP request-boundary detection.
///
/// The proxy forwards bytes opaquely; the only piece of HTTP it understands
/// is the blank line terminating the request headers, which is the signal
/// to pick a backend and start forwarding.
const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Byte offset one past the `\r\n\r\n` marker, or `None` while the head is
/// still incomplete. Any bytes past the marker belong to the request body
/// and are forwarded untouched.
pub fn headers_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(CRLF_CRLF.len())
        .position(|window| window == CRLF_CRLF)
        .map(|pos| pos + CRLF_CRLF.len())
}

/// Whether a complete request head has been received.
pub fn headers_complete(buffer: &[u8]) -> bool {
    headers_end(buffer).is_some()
}
