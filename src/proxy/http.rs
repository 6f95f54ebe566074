/*!
HTTP/1.x request parsing for the proxy: one request per connection.

The request head is read line by line (CRLF or bare LF), capped at 64 KiB.
Headers keep their original spelling and order; lookups are case-insensitive.
Bodies are read by `Content-Length`, de-chunked for `Transfer-Encoding: chunked`,
and empty otherwise. Any malformation is reported as `InvalidData`.
*/
use std::io::{self, BufRead, Read, Write};

pub(crate) const HEAD_CAP: usize = 64 * 1024;
pub(crate) const BODY_CAP: usize = 32 * 1024 * 1024;

/// Request line and headers of one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Header multimap in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

/// Fully read request (head + raw body bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub head: RequestHead,
    pub body: Vec<u8>,
}

fn bad(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl RequestHead {
    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("transfer-encoding"))
            .any(|(_, v)| v.to_ascii_lowercase().contains("chunked"))
    }

    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    /// Declared body length; conflicting or unparsable values are an error.
    pub fn content_length(&self) -> io::Result<Option<usize>> {
        let mut found: Option<usize> = None;
        for (k, v) in &self.headers {
            if !k.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let n: usize = v
                .trim()
                .parse()
                .map_err(|_| bad(format!("invalid content-length: {v}")))?;
            if found.is_some_and(|prev| prev != n) {
                return Err(bad("conflicting content-length headers"));
            }
            found = Some(n);
        }
        Ok(found)
    }
}

/// Read one line (without terminator), counting bytes against `budget`.
fn read_line_capped<R: BufRead>(reader: &mut R, budget: &mut usize) -> io::Result<Option<String>> {
    let mut raw = Vec::new();
    let n = reader
        .by_ref()
        .take(*budget as u64 + 1)
        .read_until(b'\n', &mut raw)?;
    if n == 0 {
        return Ok(None);
    }
    if n > *budget {
        return Err(bad("request head too large"));
    }
    *budget -= n;
    if raw.last() != Some(&b'\n') {
        return Err(bad("unexpected end of request head"));
    }
    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8(raw)
        .map(Some)
        .map_err(|_| bad("request head is not valid UTF-8"))
}

fn parse_request_line(line: &str) -> io::Result<(String, String, String)> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(bad(format!("malformed request line: {line:?}")));
    };
    if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(bad(format!("malformed method: {method:?}")));
    }
    if !version.starts_with("HTTP/1.") {
        return Err(bad(format!("unsupported protocol version: {version:?}")));
    }
    Ok((method.to_string(), target.to_string(), version.to_string()))
}

/// Parse the request line and header block.
pub fn read_request_head<R: BufRead>(reader: &mut R) -> io::Result<RequestHead> {
    let mut budget = HEAD_CAP;

    // Tolerate stray empty lines ahead of the request line.
    let request_line = loop {
        match read_line_capped(reader, &mut budget)? {
            None => return Err(bad("connection closed before request line")),
            Some(l) if l.trim().is_empty() => continue,
            Some(l) => break l,
        }
    };
    let (method, target, version) = parse_request_line(&request_line)?;

    let mut headers = Vec::new();
    loop {
        let line = read_line_capped(reader, &mut budget)?
            .ok_or_else(|| bad("connection closed inside headers"))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| bad(format!("malformed header line: {line:?}")))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(bad(format!("malformed header name: {name:?}")));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Read the body that follows `head`.
pub fn read_request_body<R: BufRead>(reader: &mut R, head: &RequestHead) -> io::Result<Vec<u8>> {
    if head.is_chunked() {
        return read_chunked(reader);
    }
    let len = match head.content_length()? {
        Some(n) => n,
        None => return Ok(Vec::new()),
    };
    if len > BODY_CAP {
        return Err(bad(format!("request body too large: {len} bytes")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            bad("request body shorter than content-length")
        } else {
            e
        }
    })?;
    Ok(body)
}

fn read_chunked<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        // Framing lines of each chunk get their own head-sized allowance.
        let mut budget = HEAD_CAP;
        let size_line = read_line_capped(reader, &mut budget)?
            .ok_or_else(|| bad("connection closed inside chunked body"))?;
        // Tolerate chunk extensions after ';'
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| bad(format!("invalid chunk size: {size_line:?}")))?;
        if size == 0 {
            // Trailers until blank line
            loop {
                match read_line_capped(reader, &mut budget)? {
                    Some(t) if !t.is_empty() => continue,
                    _ => break,
                }
            }
            return Ok(body);
        }
        if body.len().saturating_add(size) > BODY_CAP {
            return Err(bad("chunked request body too large"));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader
            .read_exact(&mut body[start..])
            .map_err(|_| bad("truncated chunk payload"))?;
        match read_line_capped(reader, &mut budget)? {
            Some(l) if l.is_empty() => {}
            _ => return Err(bad("missing CRLF after chunk payload")),
        }
    }
}

/// Convenience: head + body in one call (no 100-continue handling).
pub fn read_http_request<R: BufRead>(reader: &mut R) -> io::Result<ParsedRequest> {
    let head = read_request_head(reader)?;
    let body = read_request_body(reader, &head)?;
    Ok(ParsedRequest { head, body })
}

/// Write a small `text/plain` response with `Connection: close`.
pub fn respond_plain<W: Write>(w: &mut W, status: &str, body: &str) {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(body.as_bytes());
    let _ = w.flush();
}
