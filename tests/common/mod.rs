#![allow(dead_code)]

use chatfren::ai::ProxyClient;
use chatfren::auth::StaticToken;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use wiremock::MockServer;

pub const TOKEN: &str = "test-token";

pub fn data_line(piece: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"content": piece}}]})
    )
}

/// Event-stream body carrying `pieces` and the terminator.
pub fn sse_body(pieces: &[&str]) -> String {
    let mut body = String::from(": connected\n\n");
    for piece in pieces {
        body.push_str(&data_line(piece));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn client_for(server: &MockServer) -> ProxyClient {
    ProxyClient::with_endpoint(
        format!("{}/chat", server.uri()),
        Arc::new(StaticToken::new(TOKEN)),
    )
}

/// Reads one HTTP request (headers plus content-length body).
pub async fn read_request(socket: &mut TcpStream) {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        received.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&received).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if received.len() >= header_end + 4 + content_length {
                return;
            }
        }
    }
}
