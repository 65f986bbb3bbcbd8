//! # AI 网关路径集成测试
//!
//! 以 wiremock 充当上游，验证凭证替换、故障转移、用量计数和密钥文件热重载。

mod common;

use common::{TestGateway, today, wait_until, write_keys};
use lan_gateway::config::ApiKeyConfig;
use serde_json::json;
use wiremock::matchers::{body_json, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const MODEL: &str = "gemini-2.0-flash";
const UPSTREAM_PATH: &str = "/v1beta/models/gemini-2.0-flash:generateContent";

fn key(api_key: &str) -> ApiKeyConfig {
    ApiKeyConfig::new(api_key, MODEL, 10)
}

fn usage_of(gateway: &TestGateway, api_key: &str) -> u64 {
    gateway
        .key_store
        .usage()
        .count_for(&ApiKeyConfig::derive_id(api_key, MODEL), today())
}

async fn start_with_upstream(keys: &[ApiKeyConfig], upstream: &MockServer) -> TestGateway {
    let base = upstream.uri();
    TestGateway::start(keys, move |config| config.gateway.upstream_base = base).await
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_failover_to_second_key_on_rate_limit() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(UPSTREAM_PATH))
        .and(query_param("key", "k1"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path(UPSTREAM_PATH))
        .and(query_param("key", "k2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("k1"), key("k2")], &upstream).await;
    let response = client()
        .post(format!("http://{}/v1beta/models/other-model:generateContent?key=fake", gateway.addr))
        .json(&json!({"contents": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<serde_json::Value>().await.unwrap(), json!({"candidates": []}));
    assert_eq!(usage_of(&gateway, "k1"), 0);
    assert_eq!(usage_of(&gateway, "k2"), 1);

    let client_ip = "127.0.0.1".parse().unwrap();
    wait_until(|| gateway.stats.get(&client_ip).is_some()).await;
    let stats = gateway.stats.get(&client_ip).unwrap();
    assert_eq!(stats.gateway_requests, 1);
    assert_eq!(stats.success_count, 1);
    gateway.stop().await;
}

#[tokio::test]
async fn test_client_credentials_are_replaced() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(UPSTREAM_PATH))
        .respond_with(|request: &Request| {
            let keys: Vec<String> = request
                .url
                .query_pairs()
                .filter(|(name, _)| name == "key")
                .map(|(_, value)| value.into_owned())
                .collect();
            let leaked = request.headers.contains_key("x-goog-api-key")
                || request.headers.contains_key("authorization");
            if keys == ["real-key"] && !leaked {
                ResponseTemplate::new(200).set_body_string("ok")
            } else {
                ResponseTemplate::new(418).set_body_string(format!("{keys:?} leaked={leaked}"))
            }
        })
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("real-key")], &upstream).await;
    let response = client()
        .post(format!(
            "http://{}/v1beta/models/{MODEL}:generateContent?key=fake&alt=json",
            gateway.addr
        ))
        .header("x-goog-api-key", "fake")
        .header("authorization", "Bearer fake")
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
    gateway.stop().await;
}

#[tokio::test]
async fn test_body_model_follows_selected_key() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/openai/chat/completions"))
        .and(body_json(json!({"model": MODEL, "messages": []})))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("k1")], &upstream).await;
    let response = client()
        .post(format!("http://{}/v1beta/openai/chat/completions", gateway.addr))
        .json(&json!({"model": "gpt-4o", "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    gateway.stop().await;
}

#[tokio::test]
async fn test_all_keys_exhausted_returns_503() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(UPSTREAM_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .expect(2)
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("k1"), key("k2")], &upstream).await;
    let response = client()
        .post(format!("http://{}/v1beta/models/{MODEL}:generateContent", gateway.addr))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()["connection"], "close");
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], 503);
    assert_eq!(usage_of(&gateway, "k1"), 0);
    assert_eq!(usage_of(&gateway, "k2"), 0);
    gateway.stop().await;
}

#[tokio::test]
async fn test_non_key_error_is_passed_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(UPSTREAM_PATH))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": {"status": "INVALID_ARGUMENT"}})),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("k1"), key("k2")], &upstream).await;
    let response = client()
        .post(format!("http://{}/v1beta/models/{MODEL}:generateContent", gateway.addr))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["status"], "INVALID_ARGUMENT");
    assert_eq!(usage_of(&gateway, "k1"), 0);
    gateway.stop().await;
}

#[tokio::test]
async fn test_disabled_key_file_rejects_gateway_requests() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("k1")], &upstream).await;
    let document = json!({ "enabled": false, "configs": [key("k1")] });
    std::fs::write(gateway.key_file(), serde_json::to_vec(&document).unwrap()).unwrap();

    let response = client()
        .post(format!("http://{}/v1beta/models/{MODEL}:generateContent", gateway.addr))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    gateway.stop().await;
}

#[tokio::test]
async fn test_key_file_reload_takes_effect_on_next_request() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(UPSTREAM_PATH))
        .and(query_param("key", "old-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string("old"))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path(UPSTREAM_PATH))
        .and(query_param("key", "new-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string("new"))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("old-key")], &upstream).await;
    let url = format!("http://{}/v1beta/models/{MODEL}:generateContent", gateway.addr);

    let first = client().post(&url).body("{}").send().await.unwrap();
    assert_eq!(first.text().await.unwrap(), "old");

    write_keys(&gateway.key_file(), &[key("new-key")]);

    let second = client().post(&url).body("{}").send().await.unwrap();
    assert_eq!(second.text().await.unwrap(), "new");
    assert_eq!(usage_of(&gateway, "old-key"), 1);
    assert_eq!(usage_of(&gateway, "new-key"), 1);
    gateway.stop().await;
}

#[tokio::test]
async fn test_streaming_response_is_relayed() {
    let upstream = MockServer::start().await;
    let events = "data: {\"n\":1}\n\ndata: {\"n\":2}\n\n".repeat(200);
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(events.clone(), "text/event-stream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("k1")], &upstream).await;
    let response = client()
        .post(format!(
            "http://{}/v1beta/models/{MODEL}:streamGenerateContent?alt=sse",
            gateway.addr
        ))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.text().await.unwrap(), events);
    gateway.stop().await;
}

#[tokio::test]
async fn test_usage_is_persisted_on_shutdown() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(UPSTREAM_PATH))
        .and(header_exists("content-length"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let gateway = start_with_upstream(&[key("k1")], &upstream).await;
    let url = format!("http://{}/v1beta/models/{MODEL}:generateContent", gateway.addr);
    for _ in 0..3 {
        let response = client().post(&url).body("{}").send().await.unwrap();
        assert_eq!(response.status(), 200);
    }

    let usage_file = gateway.usage_file();
    let _dir = gateway.stop().await;

    let saved: serde_json::Value = serde_json::from_slice(&std::fs::read(usage_file).unwrap()).unwrap();
    let id = ApiKeyConfig::derive_id("k1", MODEL);
    let date = today().format("%Y-%m-%d").to_string();
    assert_eq!(saved["usage"][id.as_str()][date.as_str()], 3);
}
