/*!
Test support helpers shared across integration tests.

- fake_backend(dir, name, script): write an executable /bin/sh backend plus a config file
- CaptureBackend: loopback HTTP backend recording every raw request it receives
- http_exchange(port, raw): send raw bytes, return the full raw response
- free_port(): a loopback port with nothing listening on it
- wait_until(timeout, pred): poll a condition
*/
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Write `<dir>/<name>` as an executable shell script and `<dir>/config.yaml`.
#[cfg(unix)]
pub fn fake_backend(dir: &Path, name: &str, script: &str) -> (PathBuf, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let bin = dir.join(name);
    std::fs::write(&bin, format!("#!/bin/sh\n{script}\n")).expect("write fake backend");
    let mut perms = std::fs::metadata(&bin).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&bin, perms).unwrap();

    let cfg = dir.join("config.yaml");
    std::fs::write(&cfg, "port: 8318\n").expect("write config");
    (bin, cfg)
}

/// Find the end of the header block (index just past the blank line).
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0)
}

/// One captured upstream request, split into head text and body bytes.
#[derive(Debug, Clone)]
pub struct Captured {
    pub head: String,
    pub body: Vec<u8>,
}

impl Captured {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }

    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.head
            .lines()
            .skip(1)
            .filter_map(|l| l.split_once(':'))
            .filter(|(k, _)| k.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim().to_string())
            .collect()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("captured body is JSON")
    }
}

/// Loopback backend answering every connection with `response`, sent in
/// `pieces` writes with `gap` between them.
pub struct CaptureBackend {
    pub port: u16,
    pub requests: mpsc::Receiver<Captured>,
    _accept: JoinHandle<()>,
}

impl CaptureBackend {
    pub fn start(response: Vec<u8>) -> Self {
        Self::start_streaming(vec![response], Duration::ZERO)
    }

    pub fn start_streaming(pieces: Vec<Vec<u8>>, gap: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind capture backend");
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();
        let accept = std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let Some(captured) = read_upstream_request(&mut stream) else {
                    continue;
                };
                if tx.send(captured).is_err() {
                    break;
                }
                for (i, piece) in pieces.iter().enumerate() {
                    if i > 0 && !gap.is_zero() {
                        std::thread::sleep(gap);
                    }
                    if stream.write_all(piece).and_then(|_| stream.flush()).is_err() {
                        break;
                    }
                }
                let _ = stream.shutdown(Shutdown::Both);
            }
        });
        CaptureBackend {
            port,
            requests: rx,
            _accept: accept,
        }
    }

    pub fn next_request(&self) -> Captured {
        self.requests
            .recv_timeout(Duration::from_secs(5))
            .expect("backend saw no request")
    }
}

fn read_upstream_request(stream: &mut TcpStream) -> Option<Captured> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .ok()?;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let end = loop {
        if let Some(end) = head_end(&buf) {
            break end;
        }
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..end]).to_string();
    let want = content_length(&head);
    let mut body = buf[end..].to_vec();
    while body.len() < want {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some(Captured { head, body })
}

/// Send `raw` to the proxy and read until it closes the connection.
pub fn http_exchange(port: u16, raw: &[u8]) -> Vec<u8> {
    let mut s = TcpStream::connect(("127.0.0.1", port)).expect("connect proxy");
    s.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    s.write_all(raw).unwrap();
    let mut out = Vec::new();
    let _ = s.read_to_end(&mut out);
    out
}

pub fn status_line(response: &[u8]) -> String {
    String::from_utf8_lossy(response)
        .lines()
        .next()
        .unwrap_or("")
        .to_string()
}

pub fn post_json(path: &str, body: &str) -> Vec<u8> {
    format!(
        "POST {path} HTTP/1.1\r\nHost: localhost:8317\r\nContent-Type: application/json\r\nx-api-key: test-key\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// A loopback port that nothing listens on (best effort).
pub fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
