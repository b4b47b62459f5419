use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::StreamExt;
use modelgate_core_sdk::error::GatewayError;
use modelgate_core_sdk::gemini::{GeminiProvider, GEMINI_MODELS_BY_PRICE};
use modelgate_core_sdk::llm::ChatProvider;
use modelgate_core_sdk::models::Message;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "test-gemini-key";

fn provider(server: &MockServer) -> GeminiProvider {
    GeminiProvider::from_key(
        reqwest::Client::new(),
        Some(KEY),
        &format!("{}/v1beta", server.uri()),
    )
    .expect("key present")
}

async fn mount_listing(server: &MockServer, names: &[&str]) {
    let models: Vec<_> = names.iter().map(|n| json!({ "name": n })).collect();
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .and(query_param("key", KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": models })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn live_listing_is_stripped_and_price_ordered() -> Result<()> {
    let server = MockServer::start().await;
    mount_listing(&server, &["models/gemini-pro", "models/gemini-2.0-flash"]).await;

    let models = provider(&server).list_models(false).await?;
    assert_eq!(models, vec!["gemini-2.0-flash", "gemini-pro"]);
    Ok(())
}

#[tokio::test]
async fn listing_follows_page_tokens() -> Result<()> {
    let server = MockServer::start().await;
    // Mounted first so it wins over the unconditional first-page mock.
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "models/gemini-1.5-pro"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "models/gemini-pro"}, {"name": "models/gemini-2.0-flash-lite"}],
            "nextPageToken": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let models = provider(&server).list_models(false).await?;
    assert_eq!(
        models,
        vec!["gemini-2.0-flash-lite", "gemini-1.5-pro", "gemini-pro"]
    );
    Ok(())
}

#[tokio::test]
async fn listing_failure_falls_back_to_reference_table() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .expect(1)
        .mount(&server)
        .await;

    let gemini = provider(&server);
    let models = gemini.list_models(false).await?;
    assert_eq!(models, GEMINI_MODELS_BY_PRICE.to_vec());
    // The fallback listing is cached like a live one.
    gemini.list_models(false).await?;
    Ok(())
}

#[tokio::test]
async fn forced_refresh_swaps_listing_in_place() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1beta/models"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"models": [{"name": "models/gemini-2.0-flash"}]}))
                .set_delay(Duration::from_millis(400)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let gemini = provider(&server);
    gemini.list_models(false).await?;

    let reader = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        let models = gemini.list_models(false).await;
        (models, started.elapsed())
    };
    let (refreshed, (models, waited)) = tokio::join!(gemini.list_models(true), reader);
    assert_eq!(refreshed?, vec!["gemini-2.0-flash"]);
    assert_eq!(models?, vec!["gemini-2.0-flash"]);
    assert!(waited < Duration::from_millis(200), "reader waited {waited:?}");
    Ok(())
}

#[tokio::test]
async fn unknown_model_never_reaches_the_api() -> Result<()> {
    let server = MockServer::start().await;
    mount_listing(&server, &["models/gemini-2.0-flash"]).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let err = provider(&server)
        .generate(&[Message::user("hi")], Some("gemini-ultra-9"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ModelUnavailable { .. }));
    Ok(())
}

#[tokio::test]
async fn generate_maps_roles_and_reads_candidates() -> Result<()> {
    let server = MockServer::start().await;
    mount_listing(&server, &["models/gemini-2.0-flash"]).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .and(query_param("key", KEY))
        .and(body_partial_json(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"text": "hello"}]},
                {"role": "user", "parts": [{"text": "how are you?"}]}
            ],
            "system_instruction": {"parts": [{"text": "be brief"}]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Fine, "}, {"text": "thanks."}]}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = provider(&server)
        .generate(
            &[
                Message::system("be brief"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("how are you?"),
            ],
            None,
        )
        .await?;
    assert_eq!(reply, "Fine, thanks.");
    Ok(())
}

#[tokio::test]
async fn api_errors_are_wrapped() -> Result<()> {
    let server = MockServer::start().await;
    mount_listing(&server, &["models/gemini-2.0-flash"]).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota exhausted"))
        .mount(&server)
        .await;

    let err = provider(&server)
        .generate(&[Message::user("hi")], None)
        .await
        .unwrap_err();
    match err {
        GatewayError::Provider(message) => {
            assert!(message.starts_with("Gemini API error: "), "{message}");
            assert!(message.contains("429"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn stream_reads_sse_events() -> Result<()> {
    let server = MockServer::start().await;
    mount_listing(&server, &["models/gemini-2.0-flash"]).await;
    let event = |text: &str| {
        format!(
            "data: {}\r\n\r\n",
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]})
        )
    };
    let body = format!("{}{}{}", event("Hi"), event(""), event(" there"));
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let chunks: Vec<_> = provider(&server)
        .stream(vec![Message::user("hi")], None)
        .collect()
        .await;
    let chunks: Vec<String> = chunks.into_iter().collect::<Result<_, _>>()?;
    assert_eq!(chunks, vec!["Hi", " there"]);
    Ok(())
}

#[tokio::test]
async fn stream_errors_carry_prefix() -> Result<()> {
    let server = MockServer::start().await;
    mount_listing(&server, &["models/gemini-2.0-flash"]).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let mut stream = provider(&server).stream(vec![Message::user("hi")], None);
    match stream.next().await {
        Some(Err(GatewayError::Provider(message))) => {
            assert!(message.starts_with("Gemini API stream error: "), "{message}");
        }
        other => panic!("unexpected item: {other:?}"),
    }
    Ok(())
}
