use briefing::llm::remote::RemoteLlmProvider;
use briefing::llm::retry::RetryPolicy;
use briefing::llm::structured::{SummarizeError, Summarizer};
use briefing::llm::{ChatMessage, LlmError, LlmProvider, LlmRequest};
use mockito::Matcher;
use std::sync::Arc;
use std::time::Duration;

fn completion(content: &str) -> String {
    serde_json::json!({
        "model": "gemma3",
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
    .to_string()
}

#[tokio::test]
async fn test_remote_provider_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer secret")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "model": "gemma3",
            "max_tokens": 100,
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Test prompt"}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion("This is a test response"))
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(format!("{}/v1", server.url()), "gemma3")
        .with_api_key(Some("secret".into()));

    let request = LlmRequest {
        messages: vec![ChatMessage::system("Be brief."), ChatMessage::user("Test prompt")],
        max_tokens: Some(100),
        temperature: Some(0.7),
        timeout_seconds: Some(10),
        json_mode: false,
    };

    let response = provider.generate(request).await.unwrap();
    assert_eq!(response.content, "This is a test response");
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.total_tokens, 15);
    assert_eq!(response.model, "gemma3");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_error_classes() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/v1/chat/completions")
        .with_status(500)
        .with_body("model not loaded")
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(format!("{}/v1", server.url()), "gemma3");
    match provider.generate(LlmRequest::default()).await {
        Err(LlmError::Api { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "model not loaded");
        }
        other => panic!("expected API error, got {:?}", other),
    }

    let _empty = server
        .mock("POST", "/empty/v1/chat/completions")
        .with_body(r#"{"choices": []}"#)
        .create_async()
        .await;
    let provider = RemoteLlmProvider::new(format!("{}/empty/v1", server.url()), "gemma3");
    assert!(matches!(
        provider.generate(LlmRequest::default()).await,
        Err(LlmError::Empty)
    ));

    // Nothing listens on the discard port
    let provider = RemoteLlmProvider::new("http://127.0.0.1:9/v1", "gemma3");
    let err = provider.generate(LlmRequest::default()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_health_probe_uses_server_root() {
    let mut server = mockito::Server::new_async().await;
    let tags = server
        .mock("GET", "/api/tags")
        .with_status(200)
        .with_body(r#"{"models": []}"#)
        .expect(1)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(format!("{}/v1", server.url()), "gemma3");
    assert!(provider.health_check().await);
    tags.assert_async().await;

    let down = RemoteLlmProvider::new("http://127.0.0.1:9/v1", "gemma3")
        .with_health_timeout(Duration::from_millis(500));
    assert!(!down.health_check().await);
}

#[tokio::test]
async fn test_structured_output_with_mock() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::AllOf(vec![
            Matcher::PartialJson(serde_json::json!({"response_format": {"type": "json_object"}})),
            Matcher::Regex("Respond with valid JSON only".into()),
        ]))
        .with_body(completion("```json\n{\"summary\": \"ok\", \"papers\": []}\n```"))
        .create_async()
        .await;

    let provider = Arc::new(RemoteLlmProvider::new(format!("{}/v1", server.url()), "gemma3"));
    let summarizer = Summarizer::new(provider, RetryPolicy::new(0, Duration::from_millis(1)));
    let value = summarizer
        .structured_output("Summarize the papers.", "Item 1:\nTitle: A")
        .await
        .unwrap();
    assert_eq!(value["summary"], "ok");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_malformed_output_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_body(completion("I could not find anything relevant."))
        .expect(1)
        .create_async()
        .await;

    let provider = Arc::new(RemoteLlmProvider::new(format!("{}/v1", server.url()), "gemma3"));
    let summarizer = Summarizer::new(provider, RetryPolicy::new(3, Duration::from_millis(1)));
    let err = summarizer.structured_output("Summarize.", "Item 1:").await.unwrap_err();
    assert!(matches!(err, SummarizeError::Malformed(_)));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_backend_is_unavailable_after_retries() {
    let provider = Arc::new(RemoteLlmProvider::new("http://127.0.0.1:9/v1", "gemma3"));
    let summarizer = Summarizer::new(provider, RetryPolicy::new(2, Duration::from_millis(1)));
    match summarizer.structured_output("Summarize.", "Item 1:").await {
        Err(SummarizeError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected Unavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_chat_sends_history() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "temperature": 0.9,
            "messages": [
                {"role": "system", "content": "You are helpful."},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "how are you?"}
            ]
        })))
        .with_body(completion("Fine, thanks."))
        .create_async()
        .await;

    let provider = Arc::new(RemoteLlmProvider::new(format!("{}/v1", server.url()), "gemma3"));
    let summarizer = Summarizer::new(provider, RetryPolicy::default());
    let history = vec![
        ChatMessage::user("hi"),
        ChatMessage::assistant("hello"),
        ChatMessage::user("how are you?"),
    ];
    let reply = summarizer
        .chat("You are helpful.", &history, Some(0.9))
        .await
        .unwrap();
    assert_eq!(reply, "Fine, thanks.");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_structured_output_keeps_backticks_in_values() {
    let mut server = mockito::Server::new_async().await;
    let body = r#"{"summary": "Wrap it in ```code``` blocks", "assessments": [{"item_number": 1, "draft_reply": "Use ```make test``` before merging."}]}"#;
    let _m = server
        .mock("POST", "/v1/chat/completions")
        .with_body(completion(body))
        .create_async()
        .await;

    let provider = Arc::new(RemoteLlmProvider::new(format!("{}/v1", server.url()), "gemma3"));
    let summarizer = Summarizer::new(provider, RetryPolicy::new(0, Duration::from_millis(1)));
    let value = summarizer
        .structured_output("Triage the emails.", "Item 1:\nSubject: CI")
        .await
        .unwrap();
    assert_eq!(value["summary"], "Wrap it in ```code``` blocks");
    assert_eq!(
        value["assessments"][0]["draft_reply"],
        "Use ```make test``` before merging."
    );
}
