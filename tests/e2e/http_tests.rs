//! HTTP contract tests against a server bound to an ephemeral port.

use super::harness::{ScriptedBackend, TestHarness, TestServer};
use foodsense::http::{AnalyzeResponse, ErrorBody};
use foodsense::quota::Tier;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};

fn image_form() -> Form {
    let part = Part::bytes(b"\xff\xd8\xff\xe0fake-jpeg-body".to_vec())
        .file_name("plate.jpg")
        .mime_str("image/jpeg")
        .unwrap();
    Form::new().text("note", "lunch").part("image", part)
}

async fn post_scan(server: &TestServer, path: &str, token: Option<&str>, form: Form) -> reqwest::Response {
    let mut request = Client::new().post(server.url(path)).multipart(form);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    request.send().await.unwrap()
}

async fn error_of(response: reqwest::Response) -> String {
    response.json::<ErrorBody>().await.unwrap().error
}

#[tokio::test]
async fn test_anonymous_scan_succeeds() {
    let harness = TestHarness::setup().unwrap();
    let server = harness.spawn_server().await.unwrap();
    let token = harness.anonymous_token("guest-http").unwrap();

    let response = post_scan(&server, "/analyze-image", Some(&token), image_form()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: AnalyzeResponse = response.json().await.unwrap();
    assert!(body.success);
    assert_eq!(body.analysis, "A bowl of oatmeal topped with blueberries.");
    assert_eq!(body.model, "gemini-2.0-flash");
    assert!(!body.scan_id.is_empty());

    assert_eq!(harness.usage_count("guest-http").await, 1);
    let records = harness.scans.by_owner("guest-http");
    assert_eq!(records.len(), 1);
    assert!(records[0]
        .storage_reference
        .as_str()
        .starts_with("guestdata/guest-http/scans/"));
    assert!(harness.store.contains(records[0].storage_reference.as_str()));

    server.teardown().await;
}

#[tokio::test]
async fn test_api_prefixed_route() {
    let harness = TestHarness::setup().unwrap();
    let server = harness.spawn_server().await.unwrap();
    let token = harness.user_token("user-api", "u@example.com").unwrap();

    let response = post_scan(&server, "/api/analyze-image", Some(&token), image_form()).await;
    assert_eq!(response.status(), StatusCode::OK);

    server.teardown().await;
}

#[tokio::test]
async fn test_session_cookie_is_accepted() {
    let harness = TestHarness::setup().unwrap();
    let server = harness.spawn_server().await.unwrap();
    let token = harness.anonymous_token("guest-cookie").unwrap();

    let response = Client::new()
        .post(server.url("/analyze-image"))
        .header(reqwest::header::COOKIE, format!("theme=dark; __session={token}"))
        .multipart(image_form())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    server.teardown().await;
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let harness = TestHarness::setup().unwrap();
    let server = harness.spawn_server().await.unwrap();

    let response = post_scan(&server, "/analyze-image", None, image_form()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_of(response).await, "Unauthorized");
    assert_eq!(harness.store.write_count(), 0);

    server.teardown().await;
}

#[tokio::test]
async fn test_invalid_token_is_forbidden() {
    let harness = TestHarness::setup().unwrap();
    let server = harness.spawn_server().await.unwrap();

    let response = post_scan(&server, "/analyze-image", Some("garbage"), image_form()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_of(response).await, "Unauthorized");

    server.teardown().await;
}

#[tokio::test]
async fn test_unauthenticated_body_is_never_parsed() {
    let mut harness = TestHarness::setup().unwrap();
    harness.config.max_upload_bytes = 1024;
    let server = harness.spawn_server().await.unwrap();

    let truncated = Client::new()
        .post(server.url("/analyze-image"))
        .header(
            reqwest::header::CONTENT_TYPE,
            "multipart/form-data; boundary=XYZ",
        )
        .body("--XYZ\r\nContent-Disposition: form-da")
        .send()
        .await
        .unwrap();
    assert_eq!(truncated.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_of(truncated).await, "Unauthorized");

    let part = Part::bytes(vec![0xff; 4096])
        .file_name("huge.jpg")
        .mime_str("image/jpeg")
        .unwrap();
    let oversized = post_scan(&server, "/analyze-image", None, Form::new().part("image", part)).await;
    assert_eq!(oversized.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(harness.store.write_count(), 0);

    server.teardown().await;
}

#[tokio::test]
async fn test_oversized_upload_is_rejected_without_charge() {
    let mut harness = TestHarness::setup().unwrap();
    harness.config.max_upload_bytes = 1024;
    let server = harness.spawn_server().await.unwrap();
    let token = harness.anonymous_token("guest-huge").unwrap();

    let part = Part::bytes(vec![0xff; 4096])
        .file_name("huge.jpg")
        .mime_str("image/jpeg")
        .unwrap();
    let response =
        post_scan(&server, "/analyze-image", Some(&token), Form::new().part("image", part)).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(harness.usage_count("guest-huge").await, 0);
    assert_eq!(harness.store.write_count(), 0);

    server.teardown().await;
}

#[tokio::test]
async fn test_missing_image_part_is_bad_request() {
    let harness = TestHarness::setup().unwrap();
    let server = harness.spawn_server().await.unwrap();
    let token = harness.anonymous_token("guest-noimage").unwrap();

    let form = Form::new().text("note", "forgot the photo");
    let response = post_scan(&server, "/analyze-image", Some(&token), form).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_of(response).await, "No image file provided");
    assert_eq!(harness.usage_count("guest-noimage").await, 0);

    server.teardown().await;
}

#[tokio::test]
async fn test_free_tier_exhausted() {
    let harness = TestHarness::setup().unwrap();
    harness.seed_usage("free-full", Tier::Free, 25);
    let server = harness.spawn_server().await.unwrap();
    let token = harness.user_token("free-full", "full@example.com").unwrap();

    let response = post_scan(&server, "/analyze-image", Some(&token), image_form()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        error_of(response).await,
        "Quota Exceeded for Free Tier. Limit: 25, Used: 25"
    );
    assert_eq!(harness.store.write_count(), 0);
    assert_eq!(harness.backends[0].calls(), 0);

    server.teardown().await;
}

#[tokio::test]
async fn test_all_backends_failing() {
    let harness = TestHarness::setup_with_backends(vec![
        ScriptedBackend::failing("model-a", "overloaded"),
        ScriptedBackend::failing("model-b", "overloaded"),
    ])
    .unwrap();
    let server = harness.spawn_server().await.unwrap();
    let token = harness.anonymous_token("guest-unlucky").unwrap();

    let response = post_scan(&server, "/analyze-image", Some(&token), image_form()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        error_of(response).await,
        "All AI models failed to generate content."
    );
    assert!(harness.store.is_empty());
    assert_eq!(harness.usage_count("guest-unlucky").await, 1);

    server.teardown().await;
}

#[tokio::test]
async fn test_diagnostics_are_exposed_when_enabled() {
    let mut harness =
        TestHarness::setup_with_backends(vec![ScriptedBackend::failing("model-a", "bad key")])
            .unwrap();
    harness.config.inference.expose_diagnostics = true;
    let server = harness.spawn_server().await.unwrap();
    let token = harness.anonymous_token("guest-diag").unwrap();

    let response = post_scan(&server, "/analyze-image", Some(&token), image_form()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        error_of(response).await,
        r#"All AI models failed. Details: ["model-a: provider error 500: bad key"]"#
    );

    server.teardown().await;
}

#[tokio::test]
async fn test_health() {
    let harness = TestHarness::setup().unwrap();
    let server = harness.spawn_server().await.unwrap();

    let response = Client::new().get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    server.teardown().await;
}
