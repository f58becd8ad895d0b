use super::test_runtime;
use sooz_core::config::OpenRouterSettings;
use sooz_core::llm::{
    LlmConfig, LlmDriver, LlmProviderKind, Modality, OpenRouterProvider, RetryPolicy,
    TransportError,
};
use sooz_core::state::ImageRef;
use sooz_core::stream::{encode_sse, StreamObserver};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const TEST_KEY: &str = "sk-or-test-0123456789";

#[derive(Default)]
struct Recorder {
    fragments: Vec<String>,
    retries: Vec<u32>,
    errors: usize,
}

impl StreamObserver for Recorder {
    fn on_fragment(&mut self, fragment: &str, _text: &str, _images: &[ImageRef]) {
        self.fragments.push(fragment.to_owned());
    }

    fn on_error(&mut self, _error: &TransportError) {
        self.errors += 1;
    }

    fn on_retry(&mut self, attempt: u32, _error: &TransportError) {
        self.retries.push(attempt);
    }
}

fn error_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn sse_response(fragments: &[&str]) -> String {
    let fragments: Vec<String> = fragments.iter().map(|f| f.to_string()).collect();
    let body = String::from_utf8(encode_sse(&fragments)).expect("utf8");
    format!("HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{body}")
}

fn json_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = socket.read(&mut chunk).await.expect("read request");
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + body_len {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Answer one connection per scripted response, returning what was asked.
async fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let endpoint = format!("http://{}/api/v1/chat/completions", listener.local_addr().expect("addr"));
    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.expect("accept");
            requests.push(read_request(&mut socket).await);
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
        }
        requests
    });
    (endpoint, handle)
}

fn driver_for(endpoint: String) -> LlmDriver {
    let settings = OpenRouterSettings {
        api_key: TEST_KEY.to_string(),
        endpoint,
        referer: Some("https://sooz.test".to_string()),
        ..OpenRouterSettings::default()
    };
    let provider = OpenRouterProvider::new(&settings).expect("client");
    let config = LlmConfig {
        provider: LlmProviderKind::OpenRouter,
        default_model: "test/model".to_string(),
        retry: RetryPolicy::immediate(2),
    };
    LlmDriver::new(config, Arc::new(provider))
}

#[test]
fn stream_recovers_after_server_errors() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let (endpoint, server) = serve(vec![
            error_response("500 Internal Server Error", "overloaded"),
            error_response("500 Internal Server Error", "overloaded"),
            sse_response(&["Hello", " world"]),
        ])
        .await;
        let driver = driver_for(endpoint);
        let mut recorder = Recorder::default();

        let completion = driver
            .stream_completion("hi", &[], "test/model", Modality::Text, &mut recorder)
            .await
            .expect("third attempt succeeds");

        assert_eq!(completion.text, "Hello world");
        assert_eq!(recorder.fragments, vec!["Hello", " world"]);
        assert_eq!(recorder.retries, vec![1, 2]);
        assert_eq!(recorder.errors, 0);

        let requests = server.await.expect("server");
        assert_eq!(requests.len(), 3);
        let last = requests[2].to_ascii_lowercase();
        assert!(last.starts_with("post /api/v1/chat/completions"));
        assert!(last.contains(&format!("authorization: bearer {}", TEST_KEY.to_ascii_lowercase())));
        assert!(last.contains("x-title: soozai"));
        assert!(last.contains("http-referer: https://sooz.test"));
        assert!(requests[2].contains("\"stream\":true"));
        assert!(requests[2].contains("\"model\":\"test/model\""));
    });
}

#[test]
fn stream_surfaces_status_after_budget() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let (endpoint, server) = serve(vec![
            error_response("401 Unauthorized", "bad key"),
            error_response("401 Unauthorized", "bad key"),
            error_response("401 Unauthorized", "bad key"),
        ])
        .await;
        let driver = driver_for(endpoint);
        let mut recorder = Recorder::default();

        let err = driver
            .stream_completion("hi", &[], "test/model", Modality::Text, &mut recorder)
            .await
            .expect_err("all attempts fail");

        assert_eq!(
            err,
            TransportError::Status {
                status: 401,
                body: "bad key".to_string()
            }
        );
        assert_eq!(recorder.errors, 1);
        assert_eq!(server.await.expect("server").len(), 3);
    });
}

#[test]
fn image_models_send_modalities() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let (endpoint, server) = serve(vec![sse_response(&["ok"])]).await;
        let driver = driver_for(endpoint);

        driver
            .stream_completion(
                "a lighthouse at dusk",
                &[],
                "google/gemini-2.5-flash-image-preview",
                Modality::for_model("google/gemini-2.5-flash-image-preview"),
                &mut Recorder::default(),
            )
            .await
            .expect("stream");

        let request = server.await.expect("server").remove(0);
        let body_start = request.find("\r\n\r\n").expect("body") + 4;
        let body: serde_json::Value = serde_json::from_str(&request[body_start..]).expect("json body");
        assert_eq!(body["modalities"], serde_json::json!(["image", "text"]));
        assert_eq!(body["image_config"]["aspect_ratio"], "16:9");
        assert_eq!(body["image_config"]["image_size"], "4K");
    });
}

#[test]
fn title_comes_from_single_shot_reply() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let (endpoint, server) = serve(vec![json_response(
            r#"{"choices":[{"message":{"role":"assistant","content":"\"Lighthouse Photography Tips.\""}}]}"#,
        )])
        .await;
        let driver = driver_for(endpoint);

        let title = driver.generate_title("how do I photograph a lighthouse").await;
        assert_eq!(title, "Lighthouse Photography Tips");

        let request = server.await.expect("server").remove(0);
        assert!(request.contains("\"max_tokens\":30"));
        assert!(!request.contains("\"stream\""));
    });
}

#[test]
fn unreachable_endpoint_falls_back_for_titles() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = format!("http://{}/v1", listener.local_addr().expect("addr"));
        drop(listener);
        let driver = driver_for(endpoint);

        let title = driver.generate_title("plan a weekend in Lisbon please").await;
        assert_eq!(title, "plan a weekend in Lisbon");
    });
}
