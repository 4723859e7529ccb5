//! Wire formats and HTTP status mapping for stylist calls and the video API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use runway::config::VideoConfig;
use runway::dispatch::http::{
    HttpDispatch, build_request_body, endpoint_url, parse_response, request_headers,
};
use runway::dispatch::registry::WireFormat;
use runway::dispatch::video::{SubmitRequest, VideoApi, XaiVideoApi};
use runway::dispatch::{ImageInput, ProviderRequest};
use runway::error::RunwayError;
use runway::pipeline::{HttpPromptWriter, PromptWriter};

fn make_req(image: Option<ImageInput>) -> ProviderRequest {
    ProviderRequest {
        prompt: "Critique this outfit".to_string(),
        model: "test-model".to_string(),
        image,
        max_tokens: None,
        deadline: Instant::now() + Duration::from_secs(10),
    }
}

fn image() -> ImageInput {
    ImageInput::from_bytes(b"jpegbytes", "image/jpeg")
}

/// Read one HTTP request: headers, then as much body as Content-Length says.
async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&raw);
        if let Some(split) = text.find("\r\n\r\n") {
            let content_length = text[..split]
                .lines()
                .find_map(|l| {
                    let lower = l.to_ascii_lowercase();
                    lower
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            if raw.len() >= split + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}

/// Serve one canned response and hand back the request that was received.
async fn serve_once(status: &'static str, body: String) -> (u16, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        request
    });
    (port, server)
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[test]
fn openai_body_puts_image_before_text() {
    let body = build_request_body(&WireFormat::OpenAi, &make_req(Some(image())));
    let content = &body["messages"][0]["content"];
    assert_eq!(content[0]["type"], "image_url");
    assert!(
        content[0]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,")
    );
    assert_eq!(content[1]["text"], "Critique this outfit");
    assert!(body.get("max_tokens").is_none());
}

#[test]
fn openai_text_only_body_is_plain_string() {
    let mut req = make_req(None);
    req.max_tokens = Some(120);
    let body = build_request_body(&WireFormat::OpenAi, &req);
    assert_eq!(body["messages"][0]["content"], "Critique this outfit");
    assert_eq!(body["max_tokens"], 120);
}

#[test]
fn anthropic_body_always_has_max_tokens() {
    let body = build_request_body(&WireFormat::Anthropic, &make_req(Some(image())));
    assert_eq!(body["max_tokens"], 1024);
    let source = &body["messages"][0]["content"][0]["source"];
    assert_eq!(source["type"], "base64");
    assert_eq!(source["media_type"], "image/jpeg");
    assert_eq!(source["data"], image().base64());
}

#[test]
fn gemini_body_uses_inline_data() {
    let mut req = make_req(Some(image()));
    req.max_tokens = Some(200);
    let body = build_request_body(&WireFormat::Gemini, &req);
    let parts = &body["contents"][0]["parts"];
    assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
    assert_eq!(parts[1]["text"], "Critique this outfit");
    assert_eq!(body["generationConfig"]["maxOutputTokens"], 200);
}

#[test]
fn gemini_model_goes_in_the_path() {
    let url = endpoint_url(
        &WireFormat::Gemini,
        "https://g.example/v1beta/models/{model}:generateContent",
        "gemini-2.0-flash",
    );
    assert_eq!(
        url,
        "https://g.example/v1beta/models/gemini-2.0-flash:generateContent"
    );
    assert_eq!(
        endpoint_url(&WireFormat::OpenAi, "https://o.example/v1", "gpt"),
        "https://o.example/v1"
    );
}

#[test]
fn headers_per_format() {
    let anthropic = request_headers(&WireFormat::Anthropic, "k");
    assert!(anthropic.contains(&("x-api-key", "k".to_string())));
    assert!(anthropic.contains(&("anthropic-version", "2023-06-01".to_string())));
    assert_eq!(
        request_headers(&WireFormat::OpenAi, "k"),
        vec![("Authorization", "Bearer k".to_string())]
    );
    assert_eq!(
        request_headers(&WireFormat::Gemini, "k"),
        vec![("x-goog-api-key", "k".to_string())]
    );
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[test]
fn parses_each_format() {
    let openai = json!({"choices": [{"message": {"content": " Bold. "}, "finish_reason": "stop"}]});
    assert_eq!(
        parse_response(&WireFormat::OpenAi, "gpt", openai.to_string().as_bytes()).unwrap(),
        "Bold."
    );

    let anthropic = json!({"content": [{"type": "text", "text": "Chic"}], "stop_reason": "end_turn"});
    assert_eq!(
        parse_response(&WireFormat::Anthropic, "claude", anthropic.to_string().as_bytes()).unwrap(),
        "Chic"
    );

    let gemini = json!({"candidates": [{"content": {"parts": [{"text": "Lux"}, {"text": "e"}]}}]});
    assert_eq!(
        parse_response(&WireFormat::Gemini, "gemini", gemini.to_string().as_bytes()).unwrap(),
        "Luxe"
    );
}

#[test]
fn refusals_are_content_rejections() {
    let openai = json!({"choices": [{"message": {"content": null, "refusal": "no"}}]});
    let err = parse_response(&WireFormat::OpenAi, "gpt", openai.to_string().as_bytes()).unwrap_err();
    assert_eq!(err.reason(), "content_rejected");

    let anthropic = json!({"content": [], "stop_reason": "refusal"});
    let err = parse_response(&WireFormat::Anthropic, "claude", anthropic.to_string().as_bytes())
        .unwrap_err();
    assert_eq!(err.reason(), "content_rejected");

    let gemini = json!({"candidates": [{"finishReason": "SAFETY"}]});
    let err =
        parse_response(&WireFormat::Gemini, "gemini", gemini.to_string().as_bytes()).unwrap_err();
    assert_eq!(err.reason(), "content_rejected");

    let blocked = json!({"promptFeedback": {"blockReason": "OTHER"}});
    let err =
        parse_response(&WireFormat::Gemini, "gemini", blocked.to_string().as_bytes()).unwrap_err();
    assert!(matches!(err, RunwayError::ContentRejected { .. }));
}

#[test]
fn blank_reply_is_empty_response() {
    let body = json!({"choices": [{"message": {"content": "   "}}]});
    let err = parse_response(&WireFormat::OpenAi, "gpt", body.to_string().as_bytes()).unwrap_err();
    assert!(matches!(err, RunwayError::EmptyResponse { .. }), "{err:?}");

    let err = parse_response(&WireFormat::OpenAi, "gpt", b"{\"choices\": []}").unwrap_err();
    assert!(matches!(err, RunwayError::EmptyResponse { .. }), "{err:?}");
}

#[test]
fn malformed_json_is_parse_error() {
    let err = parse_response(&WireFormat::Anthropic, "claude", b"<html>").unwrap_err();
    assert_eq!(err.reason(), "parse_error");
}

// ---------------------------------------------------------------------------
// query_model against a mock server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn query_model_success_sends_auth_and_body() {
    let reply = json!({"choices": [{"message": {"content": "Looks sharp"}}]}).to_string();
    let (port, server) = serve_once("200 OK", reply).await;

    let result = HttpDispatch::new()
        .query_model(
            &make_req(Some(image())),
            "gpt",
            &format!("http://127.0.0.1:{port}/v1/chat/completions"),
            "sk-test",
            &WireFormat::OpenAi,
        )
        .await
        .unwrap();

    assert_eq!(result.text, "Looks sharp");
    assert_eq!(result.provider, "gpt");
    assert_eq!(result.model, "test-model");

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /v1/chat/completions"));
    assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
    assert!(request.contains("Critique this outfit"));
}

#[tokio::test]
async fn query_model_maps_http_status() {
    let url = |port: u16| format!("http://127.0.0.1:{port}/v1/messages");

    let (port, server) = serve_once("429 Too Many Requests", "{}".to_string()).await;
    let err = HttpDispatch::new()
        .query_model(&make_req(None), "claude", &url(port), "k", &WireFormat::Anthropic)
        .await
        .unwrap_err();
    assert!(matches!(err, RunwayError::RateLimited { .. }), "{err:?}");
    assert!(err.is_retryable());
    server.await.unwrap();

    let (port, server) = serve_once("401 Unauthorized", "{}".to_string()).await;
    let err = HttpDispatch::new()
        .query_model(&make_req(None), "claude", &url(port), "k", &WireFormat::Anthropic)
        .await
        .unwrap_err();
    assert!(matches!(err, RunwayError::AuthFailed { .. }), "{err:?}");
    assert!(!err.is_retryable());
    server.await.unwrap();

    let (port, server) =
        serve_once("500 Internal Server Error", "secret stack trace".to_string()).await;
    let err = HttpDispatch::new()
        .query_model(&make_req(None), "claude", &url(port), "k", &WireFormat::Anthropic)
        .await
        .unwrap_err();
    assert!(
        matches!(err, RunwayError::Upstream { status: Some(500), .. }),
        "{err:?}"
    );
    assert!(!err.user_message().contains("secret"));
    server.await.unwrap();
}

#[tokio::test]
async fn expired_deadline_fails_before_sending() {
    let mut req = make_req(None);
    req.deadline = Instant::now();
    let err = HttpDispatch::new()
        .query_model(&req, "gpt", "http://127.0.0.1:9/", "k", &WireFormat::OpenAi)
        .await
        .unwrap_err();
    assert!(matches!(err, RunwayError::Timeout(_)), "{err:?}");
}

// ---------------------------------------------------------------------------
// Video API transport
// ---------------------------------------------------------------------------

fn video_api(port: u16) -> XaiVideoApi {
    XaiVideoApi::new(
        HttpDispatch::new().client().clone(),
        &format!("http://127.0.0.1:{port}/v1/"),
        "xai-key",
        Duration::from_secs(5),
    )
}

fn submit_req() -> SubmitRequest {
    SubmitRequest {
        model: "grok-imagine-video".to_string(),
        prompt: "spins".to_string(),
        image_url: "https://img.example/a.jpg".to_string(),
        duration: 6,
    }
}

#[tokio::test]
async fn video_submit_posts_json() {
    let (port, server) = serve_once("200 OK", json!({"request_id": "r-9"}).to_string()).await;

    let body = video_api(port).submit(&submit_req()).await.unwrap();
    assert_eq!(body["request_id"], "r-9");

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /v1/videos/generations"));
    assert!(request.contains("\"image_url\":\"https://img.example/a.jpg\""));
    assert!(request.contains("\"duration\":6"));
}

#[tokio::test]
async fn video_submit_error_body_is_passed_through() {
    let (port, server) = serve_once(
        "400 Bad Request",
        json!({"error": "image too small"}).to_string(),
    )
    .await;

    let body = video_api(port).submit(&submit_req()).await.unwrap();
    assert_eq!(body["error"], "image too small");
    server.await.unwrap();
}

#[tokio::test]
async fn video_status_maps_failures() {
    let (port, server) = serve_once("503 Service Unavailable", String::new()).await;
    let err = video_api(port).status("r-9").await.unwrap_err();
    assert!(
        matches!(err, RunwayError::Upstream { status: Some(503), .. }),
        "{err:?}"
    );
    let request = server.await.unwrap();
    assert!(request.starts_with("GET /v1/videos/r-9"));

    let (port, server) = serve_once("403 Forbidden", String::new()).await;
    let err = video_api(port).status("r-9").await.unwrap_err();
    assert!(matches!(err, RunwayError::AuthFailed { .. }), "{err:?}");
    server.await.unwrap();
}

#[tokio::test]
async fn oversized_video_response_is_refused_before_reading() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        // Declares 4MB but never sends it.
        let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                    Content-Length: 4194304\r\n\r\n{";
        socket.write_all(head.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let err = video_api(port).status("r-9").await.unwrap_err();
    let RunwayError::Upstream { message, status, .. } = &err else {
        panic!("expected Upstream, got {err:?}");
    };
    assert!(message.contains("too large"), "{message}");
    assert_eq!(*status, None);
    server.abort();
}

// ---------------------------------------------------------------------------
// Animation prompt writer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prompt_writer_tolerates_trailing_slash() {
    let reply = json!({"choices": [{"message": {"content": "She spins."}}]}).to_string();
    let (port, server) = serve_once("200 OK", reply).await;

    let mut config = VideoConfig::with_key("xai-key".to_string());
    config.base_url = format!("http://127.0.0.1:{port}/v1/");
    let writer = HttpPromptWriter::new(Arc::new(HttpDispatch::new()), &config);

    let prompt = writer.animation_prompt("Add a scarf").await.unwrap();
    assert_eq!(prompt, "She spins.");

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /v1/chat/completions "), "{request}");
}
