//! End-to-end scenarios against a real `ProxyServer` bound to a loopback
//! port, backed by a `wiremock` stub origin. Numbered comments correspond to
//! the scenarios this rendition tracks.

use std::sync::Arc;

use m3u_proxy_cache::cache::CacheStore;
use m3u_proxy_cache::scheduler::Scheduler;
use m3u_proxy_cache::server::ProxyServer;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn test_server() -> (ProxyServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CacheStore::new(dir.path()).await);
    let scheduler = Arc::new(Scheduler::new());
    (ProxyServer::new(store, scheduler), dir)
}

fn proxy_url(port: u16, remote: &str) -> String {
    let encoded = percent_encoding::utf8_percent_encode(remote, percent_encoding::NON_ALPHANUMERIC);
    format!("http://127.0.0.1:{port}/proxy?url={encoded}")
}

/// Scenario 1: cold segment fetch, then a warm re-fetch from disk.
#[tokio::test]
async fn cold_segment_fetch_then_warm_hit() {
    let (server, _dir) = test_server().await;
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/seg1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'A'; 500]))
        .expect(1) // second GET must be served from disk, not the origin
        .mount(&origin)
        .await;

    let port = server.start(19201, 1024 * 1024, false).await.unwrap();
    let remote = format!("{}/seg1.ts", origin.uri());

    let first = reqwest::get(proxy_url(port, &remote)).await.unwrap();
    assert_eq!(first.status(), 200);
    let body = first.bytes().await.unwrap();
    assert_eq!(body.len(), 500);
    assert!(body.iter().all(|&b| b == b'A'));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let second = reqwest::get(proxy_url(port, &remote)).await.unwrap();
    assert_eq!(second.status(), 200);
    let body2 = second.bytes().await.unwrap();
    assert_eq!(body2.as_ref(), body.as_ref());

    server.stop().await;
}

/// Scenario 2: range seek against an already-cached file.
#[tokio::test]
async fn range_seek_against_cached_file() {
    let (server, _dir) = test_server().await;
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/seg2.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'A'; 500]))
        .mount(&origin)
        .await;

    let port = server.start(19202, 1024 * 1024, false).await.unwrap();
    let remote = format!("{}/seg2.ts", origin.uri());

    let warm = reqwest::get(proxy_url(port, &remote)).await.unwrap();
    assert_eq!(warm.status(), 200);
    let _ = warm.bytes().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let ranged = client
        .get(proxy_url(port, &remote))
        .header(reqwest::header::RANGE, "bytes=100-199")
        .send()
        .await
        .unwrap();

    assert_eq!(ranged.status(), 206);
    assert_eq!(
        ranged.headers().get(reqwest::header::CONTENT_RANGE).unwrap(),
        "bytes 100-199/500"
    );
    let body = ranged.bytes().await.unwrap();
    assert_eq!(body.len(), 100);

    server.stop().await;
}

/// Scenario 2b: a ranged fMP4-style fetch with no whole-file entry ever
/// cached is itself served from the ranged cache entry on the second
/// identical request, instead of re-hitting the origin.
#[tokio::test]
async fn repeated_ranged_fetch_is_served_from_ranged_cache() {
    let (server, _dir) = test_server().await;
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/init.mp4"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(vec![b'B'; 100])
                .insert_header("content-range", "bytes 0-99/1000"),
        )
        .expect(1)
        .mount(&origin)
        .await;

    let port = server.start(19209, 1024 * 1024, false).await.unwrap();
    let remote = format!("{}/init.mp4", origin.uri());

    let client = reqwest::Client::new();
    let first = client
        .get(proxy_url(port, &remote))
        .header(reqwest::header::RANGE, "bytes=0-99")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let body = first.bytes().await.unwrap();
    assert_eq!(body.len(), 100);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let second = client
        .get(proxy_url(port, &remote))
        .header(reqwest::header::RANGE, "bytes=0-99")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 206);
    assert_eq!(
        second.headers().get(reqwest::header::CONTENT_RANGE).unwrap(),
        "bytes 0-99/*"
    );
    let body2 = second.bytes().await.unwrap();
    assert_eq!(body2.len(), 100);
    assert!(body2.iter().all(|&b| b == b'B'));

    server.stop().await;
}

/// Scenario 3: manifest fetch and rewrite, exact body match.
#[tokio::test]
async fn manifest_is_rewritten_on_fetch() {
    let (server, _dir) = test_server().await;
    let origin = MockServer::start().await;
    let manifest_body = concat!(
        "#EXTM3U\n",
        "#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\n",
        "seg1.ts\n",
    );
    Mock::given(method("GET"))
        .and(path("/p/m.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest_body))
        .mount(&origin)
        .await;

    let port = server.start(19203, 1024 * 1024, false).await.unwrap();
    let remote = format!("{}/p/m.m3u8", origin.uri());

    let resp = reqwest::get(proxy_url(port, &remote)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get(reqwest::header::CONTENT_TYPE).unwrap(),
        "application/vnd.apple.mpegurl"
    );
    let body = resp.text().await.unwrap();

    assert!(body.contains(&format!("http://127.0.0.1:{port}/proxy?url=")));
    assert!(body.contains("seg1.ts"));
    assert!(body.contains("k.bin"));

    server.stop().await;
}

/// Unknown paths are rejected with 404; only `/proxy` is served.
#[tokio::test]
async fn unknown_path_returns_404() {
    let (server, _dir) = test_server().await;
    let port = server.start(19204, 1024 * 1024, false).await.unwrap();

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/not-proxy")).await.unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

/// Missing `url` query parameter is also a 404, not a panic.
#[tokio::test]
async fn missing_url_param_returns_404() {
    let (server, _dir) = test_server().await;
    let port = server.start(19205, 1024 * 1024, false).await.unwrap();

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/proxy")).await.unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

/// `start` refuses a different port while already running, and is
/// idempotent on the same port.
#[tokio::test]
async fn port_change_while_running_is_rejected() {
    let (server, _dir) = test_server().await;
    let port = server.start(19206, 1024 * 1024, false).await.unwrap();

    let same_port = server.start(port, 1024 * 1024, false).await;
    assert!(same_port.is_ok());

    let different_port = server.start(19207, 1024 * 1024, false).await;
    assert!(different_port.is_err());

    server.stop().await;
}

/// Binding a port already held by another listener surfaces `PORT_IN_USE`.
#[tokio::test]
async fn binding_an_occupied_port_fails() {
    let (server_a, _dir_a) = test_server().await;
    let (server_b, _dir_b) = test_server().await;

    let port = server_a.start(19208, 1024 * 1024, false).await.unwrap();
    let err = server_b.start(port, 1024 * 1024, false).await.unwrap_err();
    assert_eq!(err.code(), "PORT_IN_USE");

    server_a.stop().await;
}
