//! Streaming tests against a local OpenAI-compatible endpoint.
//!
//! Run with: `cargo test -p tutor-relay-providers --test openai_stream`

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use tokio_stream::StreamExt;

use tutor_relay_core::error::UpstreamError;
use tutor_relay_providers::openai::OpenAiProvider;
use tutor_relay_providers::{CompletionRequest, Credentials, LlmProvider};

const SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hola\"},\"finish_reason\":null}]}\n\n",
    ": keepalive\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"|||{\\\"translation\\\":\\\"Hi\\\"}\"},\"finish_reason\":null}]}\n\n",
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5}}\n\n",
    "data: [DONE]\n\n",
);

async fn completions(Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    // The system prompt is prepended as the first message
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "system");
    ([(header::CONTENT_TYPE, "text/event-stream")], SSE_BODY)
}

async fn rate_limited() -> impl IntoResponse {
    (StatusCode::TOO_MANY_REQUESTS, "slow down")
}

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "gpt-4o-mini".into(),
        messages: vec![serde_json::json!({"role": "user", "content": "Hola"})],
        max_tokens: 50,
        temperature: Some(0.0),
        system: Some("You are a waiter.".into()),
    }
}

fn credentials() -> Credentials {
    Credentials::ApiKey {
        api_key: "sk-test".into(),
    }
}

#[tokio::test]
async fn test_streams_deltas_until_done() {
    let base = spawn(Router::new().route("/v1/chat/completions", post(completions))).await;
    let provider = OpenAiProvider::openai(Some(&base));

    let stream = provider.stream(&request(), &credentials()).await.unwrap();
    let mut stream = std::pin::pin!(stream);

    let mut text = String::new();
    let mut stop_reason = None;
    let mut output_tokens = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.expect("Stream chunk error");
        if let Some(delta) = chunk.delta {
            text.push_str(&delta);
        }
        if chunk.stop_reason.is_some() {
            stop_reason = chunk.stop_reason;
        }
        if let Some(usage) = chunk.usage {
            output_tokens = usage.output_tokens;
        }
    }

    assert_eq!(text, "Hola|||{\"translation\":\"Hi\"}");
    assert_eq!(stop_reason.as_deref(), Some("stop"));
    assert_eq!(output_tokens, Some(5));
}

#[tokio::test]
async fn test_rate_limit_is_classified() {
    let base = spawn(Router::new().route("/v1/chat/completions", post(rate_limited))).await;
    let provider = OpenAiProvider::openai(Some(&base));

    let err = match provider.stream(&request(), &credentials()).await {
        Ok(_) => panic!("Expected a rate limit error"),
        Err(e) => e,
    };
    let upstream = err
        .downcast_ref::<UpstreamError>()
        .expect("Error should carry an UpstreamError");
    assert!(matches!(upstream, UpstreamError::RateLimited { .. }));
    assert!(!upstream.is_retryable());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transport_error() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let provider = OpenAiProvider::openai(Some(&format!("http://{addr}")));
    let err = match provider.stream(&request(), &credentials()).await {
        Ok(_) => panic!("Expected a transport error"),
        Err(e) => e,
    };
    assert!(matches!(
        err.downcast_ref::<UpstreamError>(),
        Some(UpstreamError::Transport { .. })
    ));
}

#[tokio::test]
async fn test_missing_key_is_rejected() {
    let provider = OpenAiProvider::openai(Some("http://127.0.0.1:9"));
    assert!(provider.stream(&request(), &Credentials::Anonymous).await.is_err());
}
