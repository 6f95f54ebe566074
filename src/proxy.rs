/*!
Transforming reverse proxy in front of the backend.

One thread per accepted connection, one request per connection. The
request body may be rewritten by the thinking-budget transform; the
backend's response is copied back byte for byte. A fresh backend
connection is dialled per request and always closed afterwards.

The accept loop polls a non-blocking listener and exits once the shared
running flag is cleared; in-flight handlers are left to finish on their own.
*/
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

mod forward;
mod http;
mod thinking;

pub use forward::{build_forward_request, stream_response};
pub use http::{read_http_request, read_request_body, read_request_head, ParsedRequest, RequestHead};
pub use thinking::{
    effective_budget, rewrite_body, split_model, token_ceiling, transform_request_body,
    ThinkingDirective, TokenField, HARD_CAP, MIN_HEADROOM, PROVIDER_PREFIX, THINKING_DELIMITER,
};

const ACCEPT_IDLE: Duration = Duration::from_millis(50);
const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Backend address handed to every connection handler; fixed for one run.
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
}

#[derive(Debug)]
struct Listening {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept: JoinHandle<()>,
}

#[derive(Debug)]
pub struct ThinkingProxy {
    listen_host: String,
    inner: Mutex<Option<Listening>>,
}

impl ThinkingProxy {
    pub fn new(listen_host: impl Into<String>) -> Self {
        Self {
            listen_host: listen_host.into(),
            inner: Mutex::new(None),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Option<Listening>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `listen_port` (0 picks a free port) and start accepting.
    /// Calling it again while running returns the current address.
    pub fn start(&self, listen_port: u16, target_host: &str, target_port: u16) -> io::Result<SocketAddr> {
        let mut inner = self.lock_inner();
        if let Some(l) = inner.as_ref() {
            return Ok(l.addr);
        }

        let listener = TcpListener::bind((self.listen_host.as_str(), listen_port)).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("proxy bind {}:{listen_port} failed: {e}", self.listen_host),
            )
        })?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let target = Target {
            host: target_host.to_string(),
            port: target_port,
        };
        let running_cl = running.clone();
        let accept = std::thread::spawn(move || accept_loop(listener, running_cl, target));

        info!(%addr, backend = %format!("{target_host}:{target_port}"), "thinking proxy listening");
        *inner = Some(Listening {
            addr,
            running,
            accept,
        });
        Ok(addr)
    }

    /// Close the listening socket. Connections already accepted run to completion.
    pub fn stop(&self) {
        let Some(l) = self.lock_inner().take() else {
            return;
        };
        l.running.store(false, Ordering::SeqCst);
        if l.accept.join().is_err() {
            warn!("proxy accept thread panicked");
        }
        info!(addr = %l.addr, "thinking proxy stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lock_inner().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_inner().as_ref().map(|l| l.addr)
    }
}

impl Drop for ThinkingProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, running: Arc<AtomicBool>, target: Target) {
    let target = Arc::new(target);
    while running.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    debug!("accept error: {e}");
                }
                std::thread::sleep(ACCEPT_IDLE);
                continue;
            }
        };
        let _ = stream.set_nonblocking(false);
        let target = target.clone();
        std::thread::spawn(move || {
            debug!(%peer, "connection accepted");
            handle_connection(stream, &target);
        });
    }
    // listener dropped here: the port is released
}

fn handle_connection(mut client: TcpStream, target: &Target) {
    let mut reader = match client.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(e) => {
            warn!("cannot clone client stream: {e}");
            return;
        }
    };

    let head = match http::read_request_head(&mut reader) {
        Ok(h) => h,
        Err(e) => {
            debug!("rejecting request: {e}");
            http::respond_plain(&mut client, "400 Bad Request", "Bad Request");
            let _ = client.shutdown(Shutdown::Both);
            return;
        }
    };
    if head.expects_continue() {
        let _ = client.write_all(CONTINUE_LINE).and_then(|_| client.flush());
    }
    let body = match http::read_request_body(&mut reader, &head) {
        Ok(b) => b,
        Err(e) => {
            debug!(method = %head.method, path = %head.target, "rejecting request body: {e}");
            http::respond_plain(&mut client, "400 Bad Request", "Bad Request");
            let _ = client.shutdown(Shutdown::Both);
            return;
        }
    };

    let body = thinking::transform_request_body(&head.method, &body);
    let request = forward::build_forward_request(&head, &body, &target.host, target.port);

    let mut upstream = match TcpStream::connect((target.host.as_str(), target.port)) {
        Ok(s) => s,
        Err(e) => {
            warn!(backend = %format!("{}:{}", target.host, target.port), "backend unreachable: {e}");
            http::respond_plain(&mut client, "502 Bad Gateway", "Bad Gateway");
            let _ = client.shutdown(Shutdown::Both);
            return;
        }
    };
    if let Err(e) = upstream.write_all(&request).and_then(|_| upstream.flush()) {
        warn!("writing request to backend failed: {e}");
        http::respond_plain(&mut client, "502 Bad Gateway", "Bad Gateway");
        let _ = upstream.shutdown(Shutdown::Both);
        let _ = client.shutdown(Shutdown::Both);
        return;
    }

    match forward::stream_response(&mut upstream, &mut client) {
        Ok(n) => debug!(method = %head.method, path = %head.target, bytes = n, "response relayed"),
        Err(e) => debug!(method = %head.method, path = %head.target, "response relay ended: {e}"),
    }
    let _ = upstream.shutdown(Shutdown::Both);
    let _ = client.shutdown(Shutdown::Both);
}
