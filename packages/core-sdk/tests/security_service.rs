use anyhow::Result;
use modelgate_core_sdk::auth::{
    AuthError, AuthType, Authorizer, Credentials, SecurityServiceAuthorizer,
};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn authorizer(server: &MockServer) -> SecurityServiceAuthorizer {
    SecurityServiceAuthorizer::new(reqwest::Client::new(), &server.uri(), "ai-service")
}

#[tokio::test]
async fn api_keys_are_validated_remotely() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/apikeys/validate"))
        .and(body_json(json!({
            "api_key": "sk_live_abc",
            "microservice": "ai-service",
            "resource_path": "/api/v1/chat",
            "http_method": "POST"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keyId": "key-42",
            "valid": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let identity = authorizer(&server)
        .authorize(
            &Credentials::ApiKey("sk_live_abc".into()),
            "/api/v1/chat",
            "POST",
        )
        .await?;
    assert_eq!(identity.id.as_deref(), Some("key-42"));
    assert_eq!(identity.auth_type, AuthType::ApiKey);
    Ok(())
}

#[tokio::test]
async fn tokens_carry_application_id() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/validate"))
        .and(body_json(json!({
            "token": "jwt.payload.sig",
            "application_id": "ai-service",
            "path": "/api/v1/models",
            "http_method": "GET"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "userId": "user-7",
            "valid": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let identity = authorizer(&server)
        .authorize(
            &Credentials::Token("jwt.payload.sig".into()),
            "/api/v1/models",
            "GET",
        )
        .await?;
    assert_eq!(identity.id.as_deref(), Some("user-7"));
    assert_eq!(identity.auth_type, AuthType::Token);
    Ok(())
}

#[tokio::test]
async fn rejection_uses_service_message() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/validate"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"message": "Token has expired"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/apikeys/validate"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let auth = authorizer(&server);
    match auth
        .authorize(&Credentials::Token("old".into()), "/", "GET")
        .await
    {
        Err(AuthError::Denied(message)) => assert_eq!(message, "Token has expired"),
        other => panic!("unexpected result: {other:?}"),
    }
    match auth
        .authorize(&Credentials::ApiKey("sk_test_x".into()), "/", "GET")
        .await
    {
        Err(AuthError::Denied(message)) => {
            assert_eq!(message, "API key is invalid or does not have access")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unreachable_service_is_not_a_pass() -> Result<()> {
    let auth =
        SecurityServiceAuthorizer::new(reqwest::Client::new(), "http://127.0.0.1:1", "ai-service");
    let result = auth
        .authorize(&Credentials::ApiKey("sk_live_abc".into()), "/", "GET")
        .await;
    assert!(matches!(result, Err(AuthError::Unavailable(_))), "{result:?}");
    Ok(())
}
