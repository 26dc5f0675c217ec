//! 守护进程 HTTP 接口测试
//!
//! 鉴权、CORS 白名单、路径穿越防护、审批流转与 SSE 事件流

mod common;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};

use common::{deterministic_bytes, sha256_hex, spawn_origin, test_pool, test_settings, OriginConfig};
use surge::config::{Settings, MB};
use surge::pool::{Event, WorkerPool};
use surge::server::{build_router, ServerState};
use surge::state::Store;

const TOKEN: &str = "test-token-0123456789";

async fn spawn_server(settings: Settings, dir: &Path) -> (SocketAddr, Arc<WorkerPool>, Arc<Store>) {
    let (pool, store) = test_pool(settings.clone(), dir);
    let state = Arc::new(ServerState {
        pool: pool.clone(),
        settings,
        token: TOKEN.to_string(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, pool, store)
}

/// 闸门为 0 的设置：下载永远停在排队状态，便于只测 HTTP 层
fn gated_settings(dir: &Path) -> Settings {
    let mut settings = test_settings(dir);
    settings.connections.max_global_connections = 0;
    settings
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_without_auth() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;

    let resp = client()
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("x-surge-server").unwrap().to_str().unwrap(),
        "true"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_required() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;
    let url = format!("http://{}/list", addr);

    // 无令牌
    assert_eq!(client().get(&url).send().await.unwrap().status(), 401);
    // 错误令牌
    assert_eq!(
        client()
            .get(&url)
            .bearer_auth("wrong-token")
            .send()
            .await
            .unwrap()
            .status(),
        401
    );
    // 正确令牌
    let resp = client().get(&url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body.is_array());
}

/// E6: 伪装本机域名的来源拿不到 CORS 许可，真正的本机来源原样回显
#[tokio::test(flavor = "multi_thread")]
async fn test_e6_cors_origin_allowlist() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;
    let url = format!("http://{}/download?id=nope", addr);

    let resp = client()
        .get(&url)
        .bearer_auth(TOKEN)
        .header("Origin", "http://localhost.evil.com")
        .send()
        .await
        .unwrap();
    assert!(
        resp.headers().get("access-control-allow-origin").is_none(),
        "伪装来源不应拿到 CORS 许可"
    );

    let resp = client()
        .get(&url)
        .bearer_auth(TOKEN)
        .header("Origin", "http://localhost:3000")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .unwrap()
            .to_str()
            .unwrap(),
        "http://localhost:3000"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cors_preflight_for_extension() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;

    let resp = client()
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{}/download", addr),
        )
        .header("Origin", "chrome-extension://abcdef")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .unwrap()
            .to_str()
            .unwrap(),
        "chrome-extension://abcdef"
    );
}

/// E7: 带 .. 的路径拿到 403，不产生任何记录和目录
#[tokio::test(flavor = "multi_thread")]
async fn test_e7_path_traversal_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;

    let resp = client()
        .post(format!("http://{}/download", addr))
        .bearer_auth(TOKEN)
        .json(&json!({
            "url": "http://127.0.0.1:9/f.bin",
            "path": "../etc",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    assert!(pool.list().is_empty(), "非法请求不应产生下载记录");
    assert!(
        !dir.path().parent().unwrap().join("etc").exists(),
        "不应在默认目录之外创建目录"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_absolute_path_outside_base_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;

    let outside = tempfile::tempdir().unwrap();
    let resp = client()
        .post(format!("http://{}/download", addr))
        .bearer_auth(TOKEN)
        .json(&json!({
            "url": "http://127.0.0.1:9/f.bin",
            "path": outside.path().to_string_lossy(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert!(pool.list().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_filename_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;
    let endpoint = format!("http://{}/download", addr);

    // 文件名携带路径分隔符
    let resp = client()
        .post(&endpoint)
        .bearer_auth(TOKEN)
        .json(&json!({
            "url": "http://127.0.0.1:9/f.bin",
            "filename": "a/b.bin",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // 文件名携带 ..
    let resp = client()
        .post(&endpoint)
        .bearer_auth(TOKEN)
        .json(&json!({
            "url": "http://127.0.0.1:9/f.bin",
            "filename": "..secret",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

/// 重复 URL 且无 UI 在线时返回 409
#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_headless_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;

    let url = "http://127.0.0.1:9/dup.bin";
    pool.add(url, dir.path(), None, Vec::new(), Default::default())
        .await
        .unwrap();

    let resp = client()
        .post(format!("http://{}/download", addr))
        .bearer_auth(TOKEN)
        .json(&json!({ "url": url }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    assert_eq!(pool.list().len(), 1);
}

/// 需要审批且有 UI 订阅时，转为 202 待确认并发布 request 事件
#[tokio::test(flavor = "multi_thread")]
async fn test_pending_approval_with_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = gated_settings(dir.path());
    settings.general.extension_prompt = true;
    let (addr, pool, _store) = spawn_server(settings, dir.path()).await;

    let mut events = pool.subscribe();

    let resp = client()
        .post(format!("http://{}/download", addr))
        .bearer_auth(TOKEN)
        .json(&json!({ "url": "http://127.0.0.1:9/approved.bin" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "pending_approval");
    assert!(!body["id"].as_str().unwrap_or_default().is_empty());

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("等待 request 事件超时")
        .unwrap();
    match event {
        Event::Request { url, .. } => assert_eq!(url, "http://127.0.0.1:9/approved.bin"),
        other => panic!("预期 request 事件，实际 {:?}", other),
    }
}

/// 扩展确认过的请求跳过审批直接入队
#[tokio::test(flavor = "multi_thread")]
async fn test_skip_approval_bypasses_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = gated_settings(dir.path());
    settings.general.extension_prompt = true;
    let (addr, _pool, _store) = spawn_server(settings, dir.path()).await;

    let resp = client()
        .post(format!("http://{}/download", addr))
        .bearer_auth(TOKEN)
        .json(&json!({
            "url": "http://127.0.0.1:9/trusted.bin",
            "skip_approval": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "queued");

    let id = body["id"].as_str().unwrap();
    let resp = client()
        .get(format!("http://{}/download?id={}", addr, id))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["status"], "queued");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_download() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, pool, store) = spawn_server(gated_settings(dir.path()), dir.path()).await;

    let id = pool
        .add(
            "http://127.0.0.1:9/gone.bin",
            dir.path(),
            None,
            Vec::new(),
            Default::default(),
        )
        .await
        .unwrap();

    let resp = client()
        .delete(format!("http://{}/download?id={}", addr, id))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client()
        .get(format!("http://{}/download?id={}", addr, id))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(store.get_entry(&id).unwrap().is_none());
}

/// 通过 HTTP 接口端到端完成一次真实下载
#[tokio::test(flavor = "multi_thread")]
async fn test_download_via_http_end_to_end() {
    let data = deterministic_bytes(3 * MB as usize, 0xe2e);
    let origin_sha = sha256_hex(&data);
    let origin = spawn_origin(OriginConfig::new(data)).await;

    let dir = tempfile::tempdir().unwrap();
    let (addr, _pool, _store) = spawn_server(test_settings(dir.path()), dir.path()).await;

    let resp = client()
        .post(format!("http://{}/download", addr))
        .bearer_auth(TOKEN)
        .json(&json!({
            "url": origin.url(),
            "filename": "via-http.bin",
            "skip_approval": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    // 轮询状态直到完成
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let resp = client()
            .get(format!("http://{}/download?id={}", addr, id))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        let status: Value = resp.json().await.unwrap();
        if status["status"] == "completed" {
            break;
        }
        assert!(Instant::now() < deadline, "HTTP 端到端下载未完成");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let content = std::fs::read(dir.path().join("via-http.bin")).unwrap();
    assert_eq!(sha256_hex(&content), origin_sha);

    // 历史记录可见
    let resp = client()
        .get(format!("http://{}/history", addr))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    let history: Value = resp.json().await.unwrap();
    assert!(history
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["id"] == id.as_str()));
}

/// SSE 事件流按 `event: <类型>` + `data: <json>` 推送
#[tokio::test(flavor = "multi_thread")]
async fn test_sse_event_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, pool, _store) = spawn_server(gated_settings(dir.path()), dir.path()).await;

    let resp = client()
        .get(format!("http://{}/events", addr))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // 连接建立后发布事件
    pool.publish(Event::Removed {
        id: "sse-test".to_string(),
    });

    let mut stream = resp.bytes_stream();
    let mut collected = String::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                collected.push_str(&String::from_utf8_lossy(&chunk));
                if collected.contains("event: removed") && collected.contains("sse-test") {
                    return;
                }
            }
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                // 超时窗口内可能只有 keep-alive，补发一次事件
                pool.publish(Event::Removed {
                    id: "sse-test".to_string(),
                });
            }
        }
    }
    panic!("未在 SSE 流中看到 removed 事件，收到: {}", collected);
}
