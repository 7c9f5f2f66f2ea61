use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::{fixture, set_parallelism, spawn_server, write_tree, DIMS};
use crate::batch::{BatchStatus, EmbedOptions};
use crate::index::Index;
use crate::provider::ProviderConfig;
use crate::service::{IndexService, ProviderUpdate};

/// Endpoint that rejects every key.
fn unauthorized_api() -> std::net::SocketAddr {
    let router = Router::new().fallback(|| async {
        (StatusCode::UNAUTHORIZED, r#"{"error":{"message":"Incorrect API key provided"}}"#)
    });
    spawn_server(router)
}

/// OpenAI-style endpoint that rejects the first `reject` requests with
/// `status`, then answers with constant vectors for callers holding `key`.
struct MockApi {
    reject: AtomicUsize,
    status: StatusCode,
    key: &'static str,
    requests: AtomicUsize,
    served: AtomicUsize,
}

fn mock_api(reject: usize, status: StatusCode, key: &'static str) -> (Arc<MockApi>, SocketAddr) {
    let api = Arc::new(MockApi {
        reject: AtomicUsize::new(reject),
        status,
        key,
        requests: AtomicUsize::new(0),
        served: AtomicUsize::new(0),
    });
    let state = api.clone();
    let router = Router::new().fallback(move |headers: HeaderMap, Json(body): Json<Value>| {
        let api = state.clone();
        async move {
            api.requests.fetch_add(1, Ordering::SeqCst);
            let authorized = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                == Some(format!("Bearer {}", api.key).as_str());
            let rejecting = api
                .reject
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !authorized {
                return (StatusCode::UNAUTHORIZED, r#"{"error":{"message":"bad key"}}"#)
                    .into_response();
            }
            if rejecting {
                return (api.status, r#"{"error":{"message":"rejected"}}"#).into_response();
            }

            let inputs = body["input"].as_array().map_or(0, Vec::len);
            let data: Vec<Value> = (0..inputs)
                .map(|index| {
                    let embedding = vec![1.0f32; DIMS];
                    json!({ "index": index, "embedding": embedding })
                })
                .collect();
            api.served.fetch_add(inputs, Ordering::SeqCst);
            Json(json!({ "data": data })).into_response()
        }
    });
    (api, spawn_server(router))
}

fn multi_config(addr: SocketAddr) -> ProviderConfig {
    ProviderConfig::Multi {
        providers: vec![
            ProviderConfig::OpenAi {
                endpoint: format!("http://{addr}/v1"),
                model: "text-embedding-3-small".to_string(),
                dimensions: Some(DIMS),
            },
            ProviderConfig::Hashing { dimensions: DIMS },
        ],
    }
}

fn multi_with_key(addr: SocketAddr, key: &str) -> ProviderUpdate {
    ProviderUpdate {
        config: multi_config(addr),
        secrets: BTreeMap::from([("openai".to_string(), key.to_string())]),
    }
}

/// Live vectors stored per member space, in fallback order.
fn vectors_per_member(dir: &std::path::Path) -> Vec<usize> {
    let index = Index::open(dir).unwrap();
    let table = index.load_records().unwrap().table;
    index
        .configured_spaces()
        .unwrap()
        .into_iter()
        .map(|space| index.load_vectors(space, &table).unwrap().len())
        .collect()
}

fn multi_with_failing_primary(addr: SocketAddr) -> ProviderUpdate {
    ProviderUpdate {
        config: ProviderConfig::Multi {
            providers: vec![
                ProviderConfig::OpenAi {
                    endpoint: format!("http://{addr}/v1"),
                    model: "text-embedding-3-small".to_string(),
                    dimensions: Some(DIMS),
                },
                ProviderConfig::Hashing { dimensions: DIMS },
            ],
        },
        secrets: BTreeMap::from([("openai".to_string(), "sk-bad".to_string())]),
    }
}

#[test]
fn test_rejected_primary_falls_back_to_next_member() {
    let fx = fixture(&[
        ("a.md", "first document"),
        ("b.md", "second document"),
        ("c.md", "third document"),
    ]);
    let addr = unauthorized_api();
    let view = fx
        .service
        .save_provider_config(&fx.dir, &multi_with_failing_primary(addr))
        .unwrap();
    assert_eq!(view.kind, "multi");

    fx.service
        .start_embedding(&fx.dir, &EmbedOptions::default())
        .unwrap();
    let done = fx.service.wait_for_embedding(&fx.dir).unwrap().unwrap();

    assert_eq!(done.status, BatchStatus::Complete);
    assert_eq!(done.failed_files, 0);
    let stats = fx.service.get_stats(&fx.dir).unwrap();
    assert_eq!(stats.embedding_count, 3);
    assert_eq!(stats.active_provider.unwrap().kind, "multi");
}

#[test]
fn test_validate_reports_each_member() {
    let fx = fixture(&[("a.md", "only file")]);
    let addr = unauthorized_api();
    fx.service
        .save_provider_config(&fx.dir, &multi_with_failing_primary(addr))
        .unwrap();

    let reports = fx.service.validate_provider(&fx.dir).unwrap();
    assert_eq!(reports.len(), 2);

    assert_eq!(reports[0].provider, "openai");
    assert!(!reports[0].success);
    assert_eq!(reports[0].status_code, Some(401));
    assert_eq!(
        reports[0].resolved_url.as_deref(),
        Some(format!("http://{addr}/v1/embeddings").as_str())
    );

    assert_eq!(reports[1].provider, "hashing");
    assert!(reports[1].success);
}

#[test]
fn test_secret_stays_out_of_provider_view() {
    let fx = fixture(&[("a.md", "only file")]);
    let addr = unauthorized_api();
    fx.service
        .save_provider_config(&fx.dir, &multi_with_failing_primary(addr))
        .unwrap();

    let view = fx.service.provider_config(&fx.dir).unwrap();
    let rendered = serde_json::to_string(&view).unwrap();
    assert!(!rendered.contains("sk-bad"));

    let on_disk = std::fs::read_to_string(fx.dir.join("provider.yaml")).unwrap();
    assert!(!on_disk.contains("sk-bad"));
}

#[test]
fn test_fallback_vectors_kept_apart_from_primary() {
    let fx = fixture(&[
        ("a.md", "first document"),
        ("b.md", "second document"),
        ("c.md", "third document"),
    ]);
    set_parallelism(&fx.dir, 1);
    let (api, addr) = mock_api(1, StatusCode::BAD_REQUEST, "sk-live");
    fx.service
        .save_provider_config(&fx.dir, &multi_with_key(addr, "sk-live"))
        .unwrap();

    // one file per batch: the first falls back, the others reach the primary
    let options = EmbedOptions {
        max_files: None,
        batch_size: Some(1),
    };
    fx.service.start_embedding(&fx.dir, &options).unwrap();
    let done = fx.service.wait_for_embedding(&fx.dir).unwrap().unwrap();
    assert_eq!(done.status, BatchStatus::Complete);
    assert_eq!(done.embedded_files, 3);
    assert_eq!(api.served.load(Ordering::SeqCst), 2);

    assert_eq!(vectors_per_member(&fx.dir), vec![2, 1]);
    assert_eq!(fx.service.get_stats(&fx.dir).unwrap().embedding_count, 2);

    // the next run moves the straggler onto the primary
    fx.service.start_embedding(&fx.dir, &options).unwrap();
    let done = fx.service.wait_for_embedding(&fx.dir).unwrap().unwrap();
    assert_eq!(done.embedded_files, 1);
    assert_eq!(vectors_per_member(&fx.dir)[0], 3);
    assert_eq!(fx.service.get_stats(&fx.dir).unwrap().embedding_count, 3);
}

#[test]
fn test_primary_retried_on_next_run() {
    let fx = fixture(&[("a.md", "first document"), ("b.md", "second document")]);
    set_parallelism(&fx.dir, 1);
    let (api, addr) = mock_api(usize::MAX, StatusCode::FORBIDDEN, "sk-live");
    fx.service
        .save_provider_config(&fx.dir, &multi_with_key(addr, "sk-live"))
        .unwrap();

    fx.service
        .start_embedding(&fx.dir, &EmbedOptions::default())
        .unwrap();
    let done = fx.service.wait_for_embedding(&fx.dir).unwrap().unwrap();
    assert_eq!(done.status, BatchStatus::Complete);
    assert_eq!(vectors_per_member(&fx.dir), vec![0, 2]);
    let rejected = api.requests.load(Ordering::SeqCst);

    // access restored upstream; same service, same cached provider
    api.reject.store(0, Ordering::SeqCst);
    write_tree(fx.root.path(), &[("c.md", "third document")]);
    fx.rescan();

    fx.service
        .start_embedding(&fx.dir, &EmbedOptions::default())
        .unwrap();
    let done = fx.service.wait_for_embedding(&fx.dir).unwrap().unwrap();
    assert_eq!(done.status, BatchStatus::Complete);
    assert!(api.requests.load(Ordering::SeqCst) > rejected);
    assert_eq!(api.served.load(Ordering::SeqCst), 3);
    assert_eq!(vectors_per_member(&fx.dir)[0], 3);
}

#[test]
fn test_key_saved_elsewhere_rebuilds_provider() {
    let fx = fixture(&[("a.md", "first document"), ("b.md", "second document")]);
    set_parallelism(&fx.dir, 1);
    let (api, addr) = mock_api(0, StatusCode::OK, "sk-good");
    fx.service
        .save_provider_config(&fx.dir, &multi_with_key(addr, "sk-bad"))
        .unwrap();

    fx.service
        .start_embedding(&fx.dir, &EmbedOptions::default())
        .unwrap();
    fx.service.wait_for_embedding(&fx.dir).unwrap().unwrap();
    assert_eq!(api.served.load(Ordering::SeqCst), 0);

    // a second process fixes the key on disk; this service still holds the old build
    IndexService::new()
        .save_provider_config(&fx.dir, &multi_with_key(addr, "sk-good"))
        .unwrap();

    fx.service
        .start_embedding(&fx.dir, &EmbedOptions::default())
        .unwrap();
    let done = fx.service.wait_for_embedding(&fx.dir).unwrap().unwrap();
    assert_eq!(done.status, BatchStatus::Complete);
    assert_eq!(api.served.load(Ordering::SeqCst), 2);
    assert_eq!(vectors_per_member(&fx.dir), vec![2, 2]);
}
