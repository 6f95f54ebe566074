mod support;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde_json::json;
use support::{free_port, http_exchange, post_json, status_line, CaptureBackend};
use vibeproxy::ThinkingProxy;

const OK_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}";

fn start_proxy(backend_port: u16) -> (ThinkingProxy, u16) {
    let proxy = ThinkingProxy::new("127.0.0.1");
    let addr = proxy
        .start(0, "127.0.0.1", backend_port)
        .expect("proxy start");
    (proxy, addr.port())
}

#[test]
fn test_thinking_suffix_rewritten_before_forwarding() {
    let backend = CaptureBackend::start(OK_RESPONSE.to_vec());
    let (proxy, port) = start_proxy(backend.port);

    let resp = http_exchange(
        port,
        &post_json(
            "/v1/messages?beta=true",
            r#"{"model":"claude-sonnet-4-5-thinking-5000","max_tokens":100,"messages":[]}"#,
        ),
    );
    assert_eq!(resp, OK_RESPONSE, "response must be relayed verbatim");

    let seen = backend.next_request();
    assert_eq!(seen.request_line(), "POST /v1/messages?beta=true HTTP/1.1");
    assert_eq!(
        seen.json(),
        json!({
            "model": "claude-sonnet-4-5",
            "thinking": {"type": "enabled", "budget_tokens": 5000},
            "max_tokens": 6024,
            "messages": []
        })
    );
    assert_eq!(
        seen.header_values("content-length"),
        vec![seen.body.len().to_string()]
    );
    proxy.stop();
}

#[test]
fn test_forwarded_headers_rewritten() {
    let backend = CaptureBackend::start(OK_RESPONSE.to_vec());
    let (proxy, port) = start_proxy(backend.port);

    let raw = b"GET /v1/models HTTP/1.1\r\nHost: localhost:8317\r\nConnection: keep-alive\r\nAuthorization: Bearer abc\r\nX-Trace: 1\r\n\r\n";
    let resp = http_exchange(port, raw);
    assert_eq!(status_line(&resp), "HTTP/1.1 200 OK");

    let seen = backend.next_request();
    assert_eq!(seen.request_line(), "GET /v1/models HTTP/1.1");
    assert_eq!(
        seen.header_values("host"),
        vec![format!("127.0.0.1:{}", backend.port)]
    );
    assert_eq!(seen.header_values("connection"), vec!["close".to_string()]);
    assert_eq!(seen.header_values("content-length"), vec!["0".to_string()]);
    assert_eq!(seen.header_values("authorization"), vec!["Bearer abc".to_string()]);
    assert_eq!(seen.header_values("x-trace"), vec!["1".to_string()]);
    assert!(seen.body.is_empty());
    proxy.stop();
}

#[test]
fn test_non_matching_bodies_forwarded_byte_identical() {
    let backend = CaptureBackend::start(OK_RESPONSE.to_vec());
    let (proxy, port) = start_proxy(backend.port);

    for body in [
        r#"{ "model" : "gpt-5-thinking-9000",  "max_tokens": 1 }"#,
        r#"{"model":"claude-opus-4-1","stream":true}"#,
        "plain text, not json",
    ] {
        let _ = http_exchange(port, &post_json("/v1/chat/completions", body));
        let seen = backend.next_request();
        assert_eq!(seen.body, body.as_bytes());
    }
    proxy.stop();
}

#[test]
fn test_chunked_request_is_dechunked_and_transformed() {
    let backend = CaptureBackend::start(OK_RESPONSE.to_vec());
    let (proxy, port) = start_proxy(backend.port);

    let body = r#"{"model":"claude-x-thinking-abc"}"#;
    let (a, b) = body.split_at(10);
    let raw = format!(
        "POST /v1/messages HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{a}\r\n{:x}\r\n{b}\r\n0\r\n\r\n",
        a.len(),
        b.len()
    );
    let resp = http_exchange(port, raw.as_bytes());
    assert_eq!(status_line(&resp), "HTTP/1.1 200 OK");

    let seen = backend.next_request();
    assert!(seen.header_values("transfer-encoding").is_empty());
    assert_eq!(seen.json(), json!({"model": "claude-x"}));
    proxy.stop();
}

#[test]
fn test_expect_continue_answered_locally() {
    let backend = CaptureBackend::start(OK_RESPONSE.to_vec());
    let (proxy, port) = start_proxy(backend.port);

    let body = r#"{"model":"claude-x-thinking-40000"}"#;
    let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
    s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(
        s,
        "POST /v1/messages HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .unwrap();

    let interim = b"HTTP/1.1 100 Continue\r\n\r\n";
    let mut got = vec![0u8; interim.len()];
    s.read_exact(&mut got).unwrap();
    assert_eq!(got, interim);

    s.write_all(body.as_bytes()).unwrap();
    let mut rest = Vec::new();
    let _ = s.read_to_end(&mut rest);
    assert_eq!(rest, OK_RESPONSE);

    let seen = backend.next_request();
    assert!(seen.header_values("expect").is_empty());
    assert_eq!(seen.json()["thinking"]["budget_tokens"], 31999);
    assert_eq!(seen.json()["max_tokens"], 32000);
    proxy.stop();
}

#[test]
fn test_malformed_request_gets_400_without_forwarding() {
    let backend = CaptureBackend::start(OK_RESPONSE.to_vec());
    let (proxy, port) = start_proxy(backend.port);

    let resp = http_exchange(port, b"THIS IS NOT HTTP\r\n\r\n");
    assert_eq!(status_line(&resp), "HTTP/1.1 400 Bad Request");
    assert!(backend
        .requests
        .recv_timeout(Duration::from_millis(300))
        .is_err());
    proxy.stop();
}

#[test]
fn test_unreachable_backend_gets_502() {
    let (proxy, port) = start_proxy(free_port());
    let resp = http_exchange(port, &post_json("/v1/messages", r#"{"model":"claude-x"}"#));
    assert_eq!(status_line(&resp), "HTTP/1.1 502 Bad Gateway");
    assert!(String::from_utf8_lossy(&resp).ends_with("Bad Gateway"));
    proxy.stop();
}

#[test]
fn test_streamed_response_passes_through_untouched() {
    let pieces: Vec<Vec<u8>> = vec![
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n"
            .to_vec(),
        b"1d\r\nevent: message_start\ndata: 1\n\r\n".to_vec(),
        b"1d\r\nevent: message_delta\ndata: 2\n\r\n".to_vec(),
        b"0\r\n\r\n".to_vec(),
    ];
    let expected: Vec<u8> = pieces.concat();
    let backend = CaptureBackend::start_streaming(pieces, Duration::from_millis(50));
    let (proxy, port) = start_proxy(backend.port);

    let resp = http_exchange(
        port,
        &post_json("/v1/messages", r#"{"model":"claude-x-thinking-2000","stream":true}"#),
    );
    assert_eq!(resp, expected);
    let _ = backend.next_request();
    proxy.stop();
}

#[test]
fn test_concurrent_clients_are_served_independently() {
    let backend = CaptureBackend::start(OK_RESPONSE.to_vec());
    let (proxy, port) = start_proxy(backend.port);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            std::thread::spawn(move || {
                let body = format!(r#"{{"model":"claude-x-thinking-{}"}}"#, 1000 + i);
                http_exchange(port, &post_json("/v1/messages", &body))
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), OK_RESPONSE);
    }
    let mut budgets: Vec<i64> = (0..8)
        .map(|_| backend.next_request().json()["thinking"]["budget_tokens"].as_i64().unwrap())
        .collect();
    budgets.sort_unstable();
    assert_eq!(budgets, (1000..1008).collect::<Vec<_>>());
    proxy.stop();
}

#[test]
fn test_stop_refuses_new_connections() {
    let (proxy, port) = start_proxy(free_port());
    assert!(proxy.is_running());
    proxy.stop();
    assert!(!proxy.is_running());
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
}
