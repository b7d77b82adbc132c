//! End-to-end engine scenarios: real config resolution, CMS sites served by
//! local fixtures, and the full orchestrator wiring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use vodhub_core::cache::CacheStore;
use vodhub_core::config::ConfigResolver;
use vodhub_core::events::EventBus;
use vodhub_core::fetcher::{Fetcher, FetcherConfig};
use vodhub_core::orchestrator::{ExtractorBackends, HookOptions, NoopUserDataSink, Orchestrator};
use vodhub_core::script::NoScriptRuntime;
use vodhub_core::spider::SpiderManager;
use vodhub_core::Error;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

/// CMS fixture with three sites behind one router: `a` and `c` answer
/// searches, `b` hangs, `demo` serves home/category.
async fn cms_fixture(home_hits: Arc<AtomicUsize>) -> String {
    let router = Router::new().route(
        "/{site}/api/",
        get(
            move |axum::extract::Path(site): axum::extract::Path<String>,
                  Query(params): Query<HashMap<String, String>>| {
                let home_hits = home_hits.clone();
                async move {
                    if site == "b" {
                        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    }
                    let body = match params.get("ac").map(String::as_str) {
                        None => {
                            if site == "demo" {
                                home_hits.fetch_add(1, Ordering::SeqCst);
                            }
                            serde_json::json!({
                                "class": [
                                    {"type_id": "1", "type_name": "电影"},
                                    {"type_id": "2", "type_name": "电视剧"}
                                ]
                            })
                        }
                        Some("list") if params.contains_key("wd") => match site.as_str() {
                            "a" => serde_json::json!({
                                "list": [{"vod_id": "a1", "vod_name": "金刚"}]
                            }),
                            "c" => serde_json::json!({
                                "list": [
                                    {"vod_id": "c1", "vod_name": "金刚"},
                                    {"vod_id": "c2", "vod_name": "蜘蛛"}
                                ]
                            }),
                            _ => serde_json::json!({"list": []}),
                        },
                        Some("list") => serde_json::json!({
                            "list": [{"vod_id": "42", "vod_name": "X"}],
                            "page": params.get("pg").cloned().unwrap_or_default(),
                            "pagecount": 5,
                            "limit": 20,
                            "total": 100
                        }),
                        Some("detail") => serde_json::json!({
                            "list": [{
                                "vod_id": "42",
                                "vod_name": "X",
                                "vod_play_from": "线路A",
                                "vod_play_url": "第1集$https://cdn.example/x-1.m3u8"
                            }]
                        }),
                        _ => serde_json::json!({}),
                    };
                    Json(body)
                }
            },
        ),
    );
    serve(router).await
}

async fn engine(cms_base: &str) -> Arc<Orchestrator> {
    let config = serde_json::json!({
        "wallpaper": "https://img.example/bg.jpg",
        "sites": [
            {"key": "demo", "name": "Demo", "type": 1,
             "api": format!("{cms_base}/demo/api/"), "searchable": 0},
            {"key": "a", "name": "A", "type": 1,
             "api": format!("{cms_base}/a/api/"), "searchable": 1, "timeout": 5},
            {"key": "b", "name": "B", "type": 1,
             "api": format!("{cms_base}/b/api/"), "searchable": 1, "timeout": 2},
            {"key": "c", "name": "C", "type": 1,
             "api": format!("{cms_base}/c/api/"), "searchable": 1, "timeout": 5}
        ],
        "parses": []
    });
    let config_base = serve(Router::new().route(
        "/cfg",
        get(move || {
            let config = config.clone();
            async move { Json(config) }
        }),
    ))
    .await;

    let fetcher = Arc::new(Fetcher::new(FetcherConfig::default()).expect("fetcher"));
    let dir = tempfile::tempdir().expect("tempdir");
    let resolver = Arc::new(ConfigResolver::new(
        fetcher.clone(),
        dir.path().to_path_buf(),
        Some(format!("{config_base}/cfg")),
        None,
        EventBus::default(),
    ));
    resolver.load(&CancellationToken::new()).await.expect("config load");
    std::mem::forget(dir);

    Orchestrator::new(
        fetcher.clone(),
        Arc::new(CacheStore::new(None)),
        resolver,
        Arc::new(SpiderManager::new(fetcher, Arc::new(NoScriptRuntime))),
        EventBus::default(),
        ExtractorBackends::default(),
        HookOptions::default(),
        Arc::new(NoopUserDataSink),
    )
}

#[tokio::test]
async fn cms_home_returns_class_list() {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = engine(&cms_fixture(hits).await).await;

    let home = engine
        .home("demo", false, &CancellationToken::new())
        .await
        .expect("home");
    assert_eq!(home.class.len(), 2);
    assert_eq!(home.class[0].id, "1");
    assert_eq!(home.class[0].name, "电影");
    assert_eq!(home.class[1].id, "2");
    assert_eq!(home.class[1].name, "电视剧");
}

#[tokio::test]
async fn cms_category_pagination_normalizes() {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = engine(&cms_fixture(hits).await).await;

    let page = engine
        .category("demo", "1", 2, false, &HashMap::new(), &CancellationToken::new())
        .await
        .expect("category");
    assert_eq!(page.list.len(), 1);
    assert_eq!(page.list[0].id, "42");
    assert_eq!(page.list[0].name, "X");
    assert_eq!((page.page, page.pagecount, page.limit, page.total), (2, 5, 20, 100));
}

#[tokio::test]
async fn concurrent_search_with_partial_failure_dedups() {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = engine(&cms_fixture(hits).await).await;

    let found = engine
        .search("金刚", false, &CancellationToken::new())
        .await
        .expect("search");

    assert_eq!(found.len(), 2);
    let kong = found.iter().find(|v| v.name == "金刚").expect("金刚");
    assert_eq!(kong.site_key, "a", "first site in priority order wins the dedup");
    assert!(found.iter().any(|v| v.name == "蜘蛛"));
}

#[tokio::test]
async fn fifty_concurrent_homes_trigger_one_fetch() {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = engine(&cms_fixture(hits.clone()).await).await;

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.home("demo", false, &CancellationToken::new()).await
        }));
    }
    let mut first = None;
    for task in tasks {
        let home = task.await.expect("join").expect("home");
        if let Some(ref expected) = first {
            assert_eq!(*expected, home);
        } else {
            first = Some(home);
        }
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1, "single-flight collapses the loads");
}

#[tokio::test]
async fn play_passes_m3u8_through_without_parsers() {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = engine(&cms_fixture(hits).await).await;

    let play = engine
        .play("demo", "线路A", "https://cdn.example/x-1.m3u8", &[], &CancellationToken::new())
        .await
        .expect("play");
    assert_eq!(play.parse, 0);
    assert_eq!(play.url, "https://cdn.example/x-1.m3u8");
}

#[tokio::test]
async fn detail_keeps_play_sources_aligned() {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = engine(&cms_fixture(hits).await).await;

    let detail = engine
        .detail("demo", &["42".to_string()], &CancellationToken::new())
        .await
        .expect("detail");
    let vod = &detail.list[0];
    assert_eq!(
        vod.play_from.split("$$$").count(),
        vod.play_url.split("$$$").count()
    );
    let sources = vod.play_sources();
    assert_eq!(sources[0].episodes[0].name, "第1集");
}

#[tokio::test]
async fn empty_search_is_free() {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = engine(&cms_fixture(hits).await).await;
    let found = engine
        .search("", false, &CancellationToken::new())
        .await
        .expect("search");
    assert!(found.is_empty());
}

#[tokio::test]
async fn unknown_site_surfaces_clean_error_shape() {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = engine(&cms_fixture(hits).await).await;
    let err = engine
        .home("nope", false, &CancellationToken::new())
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::SiteNotFound(_)));
    let body = err.to_client_json();
    assert!(body["error"].as_str().is_some_and(|s| s.contains("SiteNotFound")));
}
