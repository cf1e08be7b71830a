//! PostgreSQL v3 wire fragments the proxy needs to recognize.
//!
//! The proxy never parses the protocol in full; it recognizes exactly two
//! shapes in the client-to-server byte stream, the SSLRequest that opens a
//! TLS negotiation and simple-protocol Query frames, and forwards
//! everything else opaquely.

/// SSLRequest magic number
pub const SSL_REQUEST_CODE: i32 = (1234 << 16) | 5679; // 80877103

/// The canonical 8-byte SSLRequest packet: length 8, then the request code.
pub const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

/// Message type tag of a simple-protocol Query frame.
pub const QUERY_TAG: u8 = b'Q';

/// Bytes preceding the query text in a Query frame (tag + 4-byte length).
pub const QUERY_HEADER_LEN: usize = 5;

/// Whether an initial read is an SSLRequest: exactly 8 bytes whose bytes 4-5
/// carry the high half of the request code.
pub fn is_ssl_request(buf: &[u8]) -> bool {
    buf.len() == 8 && buf[4] == 0x04 && buf[5] == 0xd2
}

/// Whether a read begins a Query frame.
pub fn is_query_frame(buf: &[u8]) -> bool {
    !buf.is_empty() && buf[0] == QUERY_TAG
}

/// Extracts the SQL text from a Query frame: the bytes after the header, up
/// to (not including) the first NUL, or the end of the read if none.
///
/// Underlong frames yield the empty string, which callers must not cache.
pub fn extract_query(buf: &[u8]) -> String {
    if buf.len() < QUERY_HEADER_LEN {
        return String::new();
    }
    let body = &buf[QUERY_HEADER_LEN..];
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

/// Builds a Query frame around `sql`: tag, big-endian length (self-inclusive),
/// NUL-terminated text.
pub fn build_query(sql: &str) -> Vec<u8> {
    let len = 4 + sql.len() + 1;
    let mut frame = Vec::with_capacity(1 + len);
    frame.push(QUERY_TAG);
    frame.extend_from_slice(&(len as i32).to_be_bytes());
    frame.extend_from_slice(sql.as_bytes());
    frame.push(0);
    frame
}
