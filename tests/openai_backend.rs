//! OpenAI-compatible backend against a mock HTTP server.

use std::time::Duration;

use secrecy::SecretString;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use group_chat_worker::error::LlmError;
use group_chat_worker::llm::{ChatBackend, ChatMessage, ChatRequest, OpenAiBackend, StreamChunk};

fn backend(server: &MockServer) -> OpenAiBackend {
    OpenAiBackend::new(&format!("{}/v1/", server.uri()), SecretString::from("sk-test"))
}

fn request() -> ChatRequest {
    ChatRequest::new(
        "gpt-4o-mini",
        vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("capital of France?"),
        ],
    )
}

async fn drain(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    chunks
}

fn sse(events: &[&str]) -> String {
    events.iter().map(|e| format!("data: {e}\n\n")).collect()
}

#[tokio::test]
async fn streams_deltas_until_done() {
    let server = MockServer::start().await;
    let body = sse(&[
        r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"{"choices":[{"delta":{"content":"Par"}}]}"#,
        r#"{"choices":[{"delta":{"content":"is."}}]}"#,
        "[DONE]",
        r#"{"choices":[{"delta":{"content":"after done"}}]}"#,
    ]);

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "gpt-4o-mini",
            "stream": true,
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let rx = backend(&server).chat_stream(request()).await.unwrap();
    let chunks = drain(rx).await;

    let text: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(text, vec!["", "Par", "is."]);
    assert!(chunks.iter().all(|c| !c.is_error()));
}

#[tokio::test]
async fn error_event_ends_stream() {
    let server = MockServer::start().await;
    let body = sse(&[
        r#"{"choices":[{"delta":{"content":"Hal"}}]}"#,
        r#"{"error":{"message":"model overloaded","type":"server_error"}}"#,
        r#"{"choices":[{"delta":{"content":"never"}}]}"#,
    ]);

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let chunks = drain(backend(&server).chat_stream(request()).await.unwrap()).await;

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].text, "Hal");
    assert_eq!(chunks[1].error_code, "server_error");
    assert_eq!(chunks[1].error, "model overloaded");
}

#[tokio::test]
async fn non_success_status_fails_to_open() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .expect(1)
        .mount(&server)
        .await;

    let err = backend(&server).chat_stream(request()).await.unwrap_err();
    match err {
        LlmError::RequestFailed { provider, reason } => {
            assert_eq!(provider, "openai");
            assert!(reason.starts_with("429"), "reason was {reason}");
            assert!(reason.contains("rate limited"));
        }
        other => panic!("expected request failure, got {other:?}"),
    }
}

#[tokio::test]
async fn dropping_receiver_closes_stalled_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Serves one SSE event, then stalls until the client hangs up.
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 16 * 1024];
        let _ = sock.read(&mut buf).await.unwrap();

        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n";
        let head = "HTTP/1.1 200 OK\r\n\
                    content-type: text/event-stream\r\n\
                    transfer-encoding: chunked\r\n\r\n";
        let chunk = format!("{:x}\r\n{event}\r\n", event.len());
        sock.write_all(head.as_bytes()).await.unwrap();
        sock.write_all(chunk.as_bytes()).await.unwrap();
        sock.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await
        .is_ok()
    });

    let client = OpenAiBackend::new(&format!("http://{addr}/v1"), SecretString::from("sk-test"));
    let mut rx = client.chat_stream(request()).await.unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.text, "Hi");
    drop(rx);

    assert!(server.await.unwrap(), "connection stayed open after the reader went away");
}
