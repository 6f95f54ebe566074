//! Upstream request construction and response relay.
use std::io::{self, Read, Write};

use super::http::RequestHead;

pub(crate) const RELAY_BUF: usize = 64 * 1024;

/// Headers the proxy recomputes or must not pass through (lowercase).
const DROPPED_HEADERS: &[&str] = &[
    "content-length",
    "host",
    "transfer-encoding",
    "connection",
    "expect",
];

fn is_dropped(name: &str) -> bool {
    DROPPED_HEADERS.iter().any(|d| name.eq_ignore_ascii_case(d))
}

/// Serialise the request sent to the backend.
///
/// Method, target and version are kept as received; client headers keep
/// their order minus the dropped set, followed by the backend `Host`,
/// `Connection: close` and a `Content-Length` for `body`.
pub fn build_forward_request(head: &RequestHead, body: &[u8], host: &str, port: u16) -> Vec<u8> {
    let mut out = String::with_capacity(256);
    out.push_str(&format!("{} {} {}\r\n", head.method, head.target, head.version));
    for (name, value) in head.headers.iter().filter(|(n, _)| !is_dropped(n)) {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Host: {host}:{port}\r\n"));
    out.push_str("Connection: close\r\n");
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Copy `upstream` to `client` chunk by chunk, flushing after every write.
/// Returns the number of bytes relayed; stops at upstream EOF or any error.
pub fn stream_response<R: Read, W: Write>(upstream: &mut R, client: &mut W) -> io::Result<u64> {
    let mut buf = vec![0u8; RELAY_BUF];
    let mut total = 0u64;
    loop {
        let n = match upstream.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        client.write_all(&buf[..n])?;
        client.flush()?;
        total += n as u64;
    }
}
