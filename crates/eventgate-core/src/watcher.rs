//! Relation watcher.
//!
//! Polls the catalog on a fixed interval and publishes schema change
//! events by diffing the textual CREATE definition of each relation
//! against a cached fingerprint. Callbacks are advisory: an observer
//! error is logged and the cache still advances, so a failing observer
//! is retried only when the definition changes again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::catalog::{CatalogSource, Relation};
use crate::error::{CatalogError, IngestError};

/// Catalog poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Per-poll timeout.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives relation lifecycle events from the watcher.
#[async_trait]
pub trait RelationObserver: Send + Sync {
    /// A relation appeared or its definition changed.
    async fn on_update(&self, relation: Relation) -> Result<(), IngestError>;

    /// A previously seen relation disappeared from the catalog.
    async fn on_delete(&self, key: &str) -> Result<(), IngestError>;
}

/// Polls a [`CatalogSource`] and emits observer callbacks on change.
pub struct RelationWatcher {
    catalog: Arc<dyn CatalogSource>,
    observer: Arc<dyn RelationObserver>,
    /// Relation key → cached definition fingerprint.
    last_definitions: Mutex<HashMap<String, String>>,
}

impl RelationWatcher {
    /// Creates a watcher with an empty fingerprint cache.
    #[must_use]
    pub fn new(catalog: Arc<dyn CatalogSource>, observer: Arc<dyn RelationObserver>) -> Self {
        Self {
            catalog,
            observer,
            last_definitions: Mutex::new(HashMap::new()),
        }
    }

    /// Performs one poll: fetch, diff, emit callbacks.
    ///
    /// Also invoked once at startup so the dispatcher has a warm handler
    /// map before traffic arrives.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when either catalog query fails; the
    /// cache is left untouched in that case.
    pub async fn refresh(&self) -> Result<(), CatalogError> {
        let snapshot = self.catalog.snapshot().await?;
        let fetched: HashSet<String> = snapshot.keys().cloned().collect();

        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        {
            let mut cache = self.last_definitions.lock();
            for (key, relation) in snapshot {
                let known = cache.contains_key(&key);
                let changed = cache
                    .get(&key)
                    .is_none_or(|cached| *cached != relation.definition);
                if !changed {
                    continue;
                }
                if known {
                    info!(relation = %key, "relation definition changed");
                } else {
                    info!(relation = %key, "new relation detected");
                }
                cache.insert(key, relation.definition.clone());
                updates.push(relation);
            }
            cache.retain(|key, _| {
                if fetched.contains(key) {
                    true
                } else {
                    info!(relation = %key, "relation deleted");
                    deletes.push(key.clone());
                    false
                }
            });
        }

        for relation in updates {
            let key = relation.key();
            if let Err(err) = self.observer.on_update(relation).await {
                warn!(relation = %key, error = %err, "relation update callback failed");
            }
        }
        for key in deletes {
            if let Err(err) = self.observer.on_delete(&key).await {
                warn!(relation = %key, error = %err, "relation delete callback failed");
            }
        }
        Ok(())
    }

    /// Polls until shutdown. A failed or slow poll is logged and the next
    /// tick retries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;

        info!("starting relation watcher");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("relation watcher stopped");
                        return;
                    }
                }
                _ = tick.tick() => {
                    match tokio::time::timeout(POLL_TIMEOUT, self.refresh()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!(error = %err, "catalog poll failed"),
                        Err(_) => warn!(timeout = ?POLL_TIMEOUT, "catalog poll timed out"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};

    use super::*;
    use crate::catalog::Column;

    /// Catalog stub that serves a scripted sequence of snapshots,
    /// repeating the last one when the script runs out.
    struct ScriptedCatalog {
        snapshots: Mutex<VecDeque<BTreeMap<String, Relation>>>,
        last: Mutex<BTreeMap<String, Relation>>,
        fail_next: Mutex<bool>,
    }

    impl ScriptedCatalog {
        fn new(snapshots: Vec<BTreeMap<String, Relation>>) -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(snapshots.into()),
                last: Mutex::new(BTreeMap::new()),
                fail_next: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl CatalogSource for ScriptedCatalog {
        async fn snapshot(&self) -> Result<BTreeMap<String, Relation>, CatalogError> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                return Err(CatalogError::Pool("catalog down".into()));
            }
            if let Some(next) = self.snapshots.lock().pop_front() {
                *self.last.lock() = next;
            }
            Ok(self.last.lock().clone())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        updates: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl RelationObserver for RecordingObserver {
        async fn on_update(&self, relation: Relation) -> Result<(), IngestError> {
            self.updates.lock().push(relation.key());
            if *self.fail.lock() {
                return Err(IngestError::UnknownRelation(relation.key()));
            }
            Ok(())
        }

        async fn on_delete(&self, key: &str) -> Result<(), IngestError> {
            self.deletes.lock().push(key.to_string());
            Ok(())
        }
    }

    fn relation(schema: &str, name: &str, definition: &str) -> Relation {
        Relation {
            id: 1,
            schema: schema.into(),
            name: name.into(),
            relation_type: "table".into(),
            definition: definition.into(),
            columns: vec![Column::new("a", "integer")],
        }
    }

    fn snapshot(relations: &[Relation]) -> BTreeMap<String, Relation> {
        relations.iter().map(|r| (r.key(), r.clone())).collect()
    }

    #[tokio::test]
    async fn new_relation_emits_one_update() {
        let t = relation("public", "t", "CREATE TABLE t (a INT)");
        let catalog = ScriptedCatalog::new(vec![snapshot(&[t])]);
        let observer = Arc::new(RecordingObserver::default());
        let watcher = RelationWatcher::new(catalog, Arc::clone(&observer) as _);

        watcher.refresh().await.unwrap();
        assert_eq!(*observer.updates.lock(), vec!["public.t"]);
        assert!(observer.deletes.lock().is_empty());
    }

    #[tokio::test]
    async fn unchanged_definition_emits_nothing() {
        let t = relation("public", "t", "CREATE TABLE t (a INT)");
        let catalog = ScriptedCatalog::new(vec![snapshot(&[t.clone()]), snapshot(&[t])]);
        let observer = Arc::new(RecordingObserver::default());
        let watcher = RelationWatcher::new(catalog, Arc::clone(&observer) as _);

        watcher.refresh().await.unwrap();
        watcher.refresh().await.unwrap();
        assert_eq!(observer.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn changed_definition_emits_exactly_once_per_change() {
        let v1 = relation("public", "t", "CREATE TABLE t (a INT)");
        let v2 = relation("public", "t", "CREATE TABLE t (a INT, b VARCHAR)");
        let catalog = ScriptedCatalog::new(vec![
            snapshot(&[v1]),
            snapshot(&[v2.clone()]),
            snapshot(&[v2]),
        ]);
        let observer = Arc::new(RecordingObserver::default());
        let watcher = RelationWatcher::new(catalog, Arc::clone(&observer) as _);

        watcher.refresh().await.unwrap();
        watcher.refresh().await.unwrap();
        watcher.refresh().await.unwrap();
        assert_eq!(*observer.updates.lock(), vec!["public.t", "public.t"]);
    }

    #[tokio::test]
    async fn vanished_relation_emits_delete() {
        let t = relation("public", "t", "CREATE TABLE t (a INT)");
        let u = relation("public", "u", "CREATE TABLE u (a INT)");
        let catalog = ScriptedCatalog::new(vec![snapshot(&[t, u.clone()]), snapshot(&[u])]);
        let observer = Arc::new(RecordingObserver::default());
        let watcher = RelationWatcher::new(catalog, Arc::clone(&observer) as _);

        watcher.refresh().await.unwrap();
        watcher.refresh().await.unwrap();
        assert_eq!(*observer.deletes.lock(), vec!["public.t"]);
        // A deleted key re-appearing later counts as new again.
    }

    #[tokio::test]
    async fn failed_poll_leaves_cache_untouched() {
        let t = relation("public", "t", "CREATE TABLE t (a INT)");
        let catalog = ScriptedCatalog::new(vec![snapshot(&[t.clone()]), snapshot(&[t])]);
        let observer = Arc::new(RecordingObserver::default());
        let watcher = RelationWatcher::new(Arc::clone(&catalog) as _, Arc::clone(&observer) as _);

        watcher.refresh().await.unwrap();
        *catalog.fail_next.lock() = true;
        watcher.refresh().await.unwrap_err();
        // The relation is still cached, so the next good poll is silent.
        watcher.refresh().await.unwrap();
        assert_eq!(observer.updates.lock().len(), 1);
        assert!(observer.deletes.lock().is_empty());
    }

    #[tokio::test]
    async fn observer_error_still_updates_the_cache() {
        let t = relation("public", "t", "CREATE TABLE t (a INT)");
        let catalog = ScriptedCatalog::new(vec![snapshot(&[t.clone()]), snapshot(&[t])]);
        let observer = Arc::new(RecordingObserver::default());
        *observer.fail.lock() = true;
        let watcher = RelationWatcher::new(catalog, Arc::clone(&observer) as _);

        watcher.refresh().await.unwrap();
        watcher.refresh().await.unwrap();
        // The failing callback fired once; the fingerprint advanced anyway.
        assert_eq!(observer.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let catalog = ScriptedCatalog::new(vec![]);
        let observer = Arc::new(RecordingObserver::default());
        let watcher = Arc::new(RelationWatcher::new(catalog, observer as _));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            async move { watcher.run(rx).await }
        });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watcher should stop promptly")
            .unwrap();
    }
}
