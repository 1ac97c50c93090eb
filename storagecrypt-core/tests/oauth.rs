use serde_json::json;
use storagecrypt_core::{AppCredentials, OAuthClient, Reason};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credentials() -> AppCredentials {
    AppCredentials {
        client_id: "client-id".into(),
        client_secret: "secret".into(),
        redirect_uri: "http://localhost/callback".into(),
        scope: Some("files".into()),
    }
}

#[test]
fn authorize_url_includes_required_params() {
    let client = OAuthClient::with_base_url("https://oauth.example", credentials())
        .expect("client should build");
    let url = client.authorize_url(Some("state-1"));

    assert_eq!(url.path(), "/authorize");
    let query = url.query().unwrap_or_default();
    assert!(query.contains("response_type=code"));
    assert!(query.contains("client_id=client-id"));
    assert!(query.contains("redirect_uri=http%3A%2F%2Flocalhost%2Fcallback"));
    assert!(query.contains("scope=files"));
    assert!(query.contains("state=state-1"));
}

#[tokio::test]
async fn exchange_code_posts_form_data() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code"))
        .and(body_string_contains("client_secret=secret"))
        .and(body_string_contains(
            "redirect_uri=http%3A%2F%2Flocalhost%2Fcallback",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "refresh"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), credentials()).unwrap();
    let token = client.exchange_code("auth-code").await.unwrap();

    assert_eq!(token.access_token, "token");
    assert_eq!(token.expires_in, Some(3600));
    let grant = token.into_grant(None);
    assert_eq!(grant.refresh_token.as_deref(), Some("refresh"));
    assert!(grant.expires_at.is_some());
}

#[tokio::test]
async fn refresh_keeps_previous_refresh_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "expires_in": 60
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), credentials()).unwrap();
    let grant = client
        .refresh_token("old-refresh")
        .await
        .unwrap()
        .into_grant(Some("old-refresh"));

    assert_eq!(grant.access_token, "fresh");
    assert_eq!(grant.refresh_token.as_deref(), Some("old-refresh"));
}

#[tokio::test]
async fn invalid_grant_is_unauthorized() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
        )
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), credentials()).unwrap();
    let err = client.refresh_token("revoked").await.expect_err("expected failure");

    assert_eq!(err.reason(), Reason::Unauthorized);
}

#[tokio::test]
async fn revoke_posts_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/revoke"))
        .and(body_string_contains("token=to-revoke"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), credentials()).unwrap();
    client.revoke_token("to-revoke").await.unwrap();
}
