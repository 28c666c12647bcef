// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Cached image maturity verdicts for display.
//!
//! A cached verdict is returned immediately even when stale; a stale hit
//! schedules one background refresh per image. Only the first lookup of an
//! image waits for the checker.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::maturity::{ImageMaturityChecker, MaturityRecord};

#[derive(Clone)]
struct CachedRecord {
    record: MaturityRecord,
    fetched_at: Instant,
}

#[derive(Clone)]
pub struct MaturityService {
    checker: Arc<dyn ImageMaturityChecker>,
    ttl: Duration,
    records: Arc<RwLock<HashMap<String, CachedRecord>>>,
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl MaturityService {
    pub fn new(checker: Arc<dyn ImageMaturityChecker>, ttl: Duration) -> Self {
        Self {
            checker,
            ttl,
            records: Arc::new(RwLock::new(HashMap::new())),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Cached verdict without triggering any lookup.
    pub fn cached(&self, image: &str) -> Option<MaturityRecord> {
        self.records.read().get(image).map(|c| c.record.clone())
    }

    pub async fn get(&self, image: &str) -> MaturityRecord {
        let cached = self.records.read().get(image).cloned();
        match cached {
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => entry.record,
            Some(entry) => {
                self.spawn_refresh(image);
                entry.record
            }
            None => self.refresh(image).await,
        }
    }

    /// Ask the checker now and cache the answer. A failed lookup caches
    /// `Unknown` until the next refresh.
    pub async fn refresh(&self, image: &str) -> MaturityRecord {
        let record = match self.checker.check_maturity(image).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Maturity lookup for {} failed: {}", image, e);
                MaturityRecord::unknown()
            }
        };
        self.records.write().insert(
            image.to_string(),
            CachedRecord {
                record: record.clone(),
                fetched_at: Instant::now(),
            },
        );
        record
    }

    fn spawn_refresh(&self, image: &str) {
        if !self.refreshing.lock().insert(image.to_string()) {
            return;
        }
        debug!("Refreshing stale maturity verdict for {}", image);
        let service = self.clone();
        let image = image.to_string();
        tokio::spawn(async move {
            service.refresh(&image).await;
            service.refreshing.lock().remove(&image);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::maturity::{MaturityError, MaturityStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChecker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageMaturityChecker for CountingChecker {
        async fn check_maturity(&self, image: &str) -> Result<MaturityRecord, MaturityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if image == "broken" {
                return Err(MaturityError::Lookup {
                    image: image.to_string(),
                    reason: "registry down".to_string(),
                });
            }
            Ok(MaturityRecord {
                current_version: Some(format!("1.{}", n)),
                status: MaturityStatus::Matured,
                ..MaturityRecord::unknown()
            })
        }
    }

    fn checker() -> Arc<CountingChecker> {
        Arc::new(CountingChecker {
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_fresh_hit_does_not_call_checker() {
        let checker = checker();
        let service = MaturityService::new(checker.clone(), Duration::from_secs(3600));
        assert_eq!(service.get("nginx").await.status, MaturityStatus::Matured);
        service.get("nginx").await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_hit_returns_cached_and_refreshes() {
        let checker = checker();
        let service = MaturityService::new(checker.clone(), Duration::ZERO);
        let first = service.get("nginx").await;
        let second = service.get("nginx").await;
        assert_eq!(first.current_version, second.current_version);

        for _ in 0..50 {
            if checker.calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(checker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_unknown() {
        let service = MaturityService::new(checker(), Duration::from_secs(60));
        assert_eq!(service.get("broken").await.status, MaturityStatus::Unknown);
        assert!(service.cached("broken").is_some());
    }
}
