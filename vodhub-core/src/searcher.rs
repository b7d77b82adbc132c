//! Concurrent multi-site search
//!
//! Fans out one task per searchable site and streams each site's raw batch
//! to the consumer as it arrives. Aggregation deduplicates by
//! `(vod_name, vod_year)` across sites, keeping the first hit in site
//! priority order. Per-site errors are swallowed and counted; the whole
//! search fails only when every site failed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Site;
use crate::error::{Error, Result};
use crate::spider::{SpiderManager, Vod};

/// One site's search batch.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub site_key: String,
    pub list: Vec<Vod>,
}

/// Outcome counters, available once the fan-out has fully terminated.
#[derive(Debug, Clone, Default)]
pub struct SearchSummary {
    pub sites: usize,
    pub failures: usize,
}

impl SearchSummary {
    pub fn all_failed(&self) -> bool {
        self.sites > 0 && self.failures == self.sites
    }
}

pub struct ConcurrentSearcher {
    manager: Arc<SpiderManager>,
}

impl ConcurrentSearcher {
    pub fn new(manager: Arc<SpiderManager>) -> Self {
        Self { manager }
    }

    /// Start the fan-out. Returns the result stream and a handle resolving
    /// to the summary after every child task has terminated.
    pub fn stream(
        &self,
        query: &str,
        quick: bool,
        sites: Vec<Site>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<SearchHit>, tokio::task::JoinHandle<SearchSummary>) {
        let (tx, rx) = mpsc::channel(16);

        let query = query.trim().to_string();
        let candidates: Vec<Site> = sites
            .into_iter()
            .filter(|s| s.searchable && (!quick || s.quick_searchable))
            .collect();

        // Empty query: no I/O at all.
        if query.is_empty() || candidates.is_empty() {
            let summary = SearchSummary::default();
            return (rx, tokio::spawn(async move { summary }));
        }

        let manager = self.manager.clone();
        let supervisor = tokio::spawn(async move {
            let total = candidates.len();
            let cap = total.min(5);
            let semaphore = Arc::new(Semaphore::new(cap));

            let global_deadline = candidates
                .iter()
                .map(|s| Duration::from_millis(s.timeout_ms()))
                .max()
                .unwrap_or(Duration::from_secs(15))
                + Duration::from_secs(2);

            let mut tasks: JoinSet<bool> = JoinSet::new();
            for site in candidates {
                let manager = manager.clone();
                let semaphore = semaphore.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                let query = query.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return false;
                    };
                    if cancel.is_cancelled() {
                        return false;
                    }

                    let mut timeout = Duration::from_millis(site.timeout_ms());
                    if quick {
                        timeout /= 2;
                    }

                    let handle = manager.get(&site).await;
                    let searched = tokio::select! {
                        biased;
                        () = cancel.cancelled() => Err(Error::Cancelled),
                        r = tokio::time::timeout(
                            timeout,
                            handle.search_content(&query, quick, &cancel),
                        ) => r.unwrap_or_else(|_| Err(Error::Timeout(site.key.clone()))),
                    };

                    match searched {
                        Ok(result) => {
                            let list: Vec<Vod> = result
                                .list
                                .into_iter()
                                .filter(|v| !v.name.is_empty())
                                .collect();
                            if !list.is_empty() {
                                let _ = tx
                                    .send(SearchHit {
                                        site_key: site.key.clone(),
                                        list,
                                    })
                                    .await;
                            }
                            true
                        }
                        Err(e) => {
                            tracing::debug!(site = %site.key, error = %e, "site search failed");
                            false
                        }
                    }
                });
            }
            drop(tx);

            let mut failures = 0usize;
            let drain = async {
                while let Some(joined) = tasks.join_next().await {
                    if !matches!(joined, Ok(true)) {
                        failures += 1;
                    }
                }
            };
            tokio::select! {
                () = drain => {}
                () = tokio::time::sleep(global_deadline) => {
                    tracing::debug!("search deadline reached, aborting stragglers");
                    let stragglers = tasks.len();
                    tasks.shutdown().await;
                    failures += stragglers;
                }
                () = cancel.cancelled() => {
                    tasks.shutdown().await;
                }
            }

            SearchSummary {
                sites: total,
                failures,
            }
        });

        (rx, supervisor)
    }

    /// Run a search to completion and aggregate.
    ///
    /// Batches are re-ordered by site priority before deduplication so that
    /// the first site claiming a `(name, year)` key wins regardless of
    /// arrival order. Fails only when every contributing site failed.
    pub async fn search_collect(
        &self,
        query: &str,
        quick: bool,
        sites: Vec<Site>,
        cancel: CancellationToken,
    ) -> Result<Vec<Vod>> {
        let priority: Vec<String> = sites.iter().map(|s| s.key.clone()).collect();
        let (mut rx, summary) = self.stream(query, quick, sites, cancel);

        let mut hits: Vec<SearchHit> = Vec::new();
        while let Some(hit) = rx.recv().await {
            hits.push(hit);
        }
        let summary = summary.await.unwrap_or_default();
        if hits.is_empty() && summary.all_failed() {
            return Err(Error::Network(format!(
                "all {} sites failed searching",
                summary.sites
            )));
        }

        hits.sort_by_key(|hit| {
            priority
                .iter()
                .position(|k| *k == hit.site_key)
                .unwrap_or(usize::MAX)
        });
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut all = Vec::new();
        for hit in hits {
            for vod in hit.list {
                if seen.insert((vod.name.clone(), vod.year.clone())) {
                    all.push(vod);
                }
            }
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{Fetcher, FetcherConfig};
    use crate::script::NoScriptRuntime;
    use axum::extract::Query;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;

    /// CMS fixture: per-site behavior keyed by the first path segment.
    async fn fixture() -> String {
        let router = Router::new().route(
            "/{site}/api/",
            get(
                |axum::extract::Path(site): axum::extract::Path<String>,
                 Query(_q): Query<HashMap<String, String>>| async move {
                    match site.as_str() {
                        "a" => axum::Json(serde_json::json!({
                            "list": [{"vod_id": "a1", "vod_name": "金刚"}]
                        }))
                        .into_response(),
                        "b" => {
                            tokio::time::sleep(Duration::from_secs(20)).await;
                            axum::Json(serde_json::json!({"list": []})).into_response()
                        }
                        "c" => axum::Json(serde_json::json!({
                            "list": [
                                {"vod_id": "c1", "vod_name": "金刚"},
                                {"vod_id": "c2", "vod_name": "蜘蛛"}
                            ]
                        }))
                        .into_response(),
                        _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn searcher() -> ConcurrentSearcher {
        ConcurrentSearcher::new(Arc::new(SpiderManager::new(
            Arc::new(Fetcher::new(FetcherConfig::default()).expect("fetcher")),
            Arc::new(NoScriptRuntime),
        )))
    }

    fn cms_site(base: &str, key: &str, timeout: u64) -> Site {
        serde_json::from_value(serde_json::json!({
            "key": key,
            "name": key,
            "type": 1,
            "api": format!("{base}/{key}/api/"),
            "searchable": 1,
            "quickSearch": 1,
            "timeout": timeout
        }))
        .expect("site")
    }

    #[tokio::test]
    async fn partial_failure_still_streams_and_dedups() {
        let base = fixture().await;
        let sites = vec![
            cms_site(&base, "a", 5),
            cms_site(&base, "b", 2), // times out
            cms_site(&base, "c", 5),
        ];

        let found = searcher()
            .search_collect("金刚", false, sites, CancellationToken::new())
            .await
            .expect("search");

        // A's 金刚 wins the dedup slot; C contributes only 蜘蛛.
        assert_eq!(found.len(), 2);
        let names: HashSet<&str> = found.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, HashSet::from(["金刚", "蜘蛛"]));
        let kong = found.iter().find(|v| v.name == "金刚").expect("hit");
        assert_eq!(kong.site_key, "a");
    }

    #[tokio::test]
    async fn all_sites_failing_surfaces_an_error() {
        let base = fixture().await;
        let sites = vec![cms_site(&base, "broken1", 2), cms_site(&base, "broken2", 2)];
        let err = searcher()
            .search_collect("金刚", false, sites, CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Network(_)));
    }

    #[tokio::test]
    async fn empty_query_returns_empty_without_io() {
        let sites = vec![cms_site("http://127.0.0.1:1", "a", 1)];
        let found = searcher()
            .search_collect("   ", false, sites, CancellationToken::new())
            .await
            .expect("search");
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn unsearchable_sites_are_skipped() {
        let base = fixture().await;
        let mut site = cms_site(&base, "a", 5);
        site.searchable = false;
        let found = searcher()
            .search_collect("金刚", false, vec![site], CancellationToken::new())
            .await
            .expect("search");
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn quick_mode_filters_by_quick_searchable() {
        let base = fixture().await;
        let mut slow_only = cms_site(&base, "a", 5);
        slow_only.quick_searchable = false;
        let found = searcher()
            .search_collect("金刚", true, vec![slow_only], CancellationToken::new())
            .await
            .expect("search");
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn consumer_cancellation_stops_pending_tasks_quickly() {
        let base = fixture().await;
        let sites = vec![cms_site(&base, "b", 30)]; // would block 20s
        let cancel = CancellationToken::new();
        let searcher = searcher();
        let (mut rx, summary) = searcher.stream("金刚", false, sites, cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let start = std::time::Instant::now();
        while rx.recv().await.is_some() {}
        let _ = summary.await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
