//! Feature watcher: a 3-second periodic reconciler per project. Reads
//! `feature_list.json` from the project's working directory, diffs against
//! the cached copy, and reports what changed so the orchestrator can
//! broadcast and react.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::broadcast::{BroadcastHub, Message};
use crate::persistence::{Feature, FeatureList, Persistence};

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub features: FeatureList,
    pub changed: bool,
    pub total: usize,
    pub passed: usize,
    pub percentage: f64,
    pub all_done: bool,
}

fn feature_key(f: &Feature) -> (bool, bool) {
    (f.passes, f.in_progress)
}

/// Features in `updated` whose `(passes, in_progress)` differs from `cached`
/// (or that are new), as `(feature_id, passes)` pairs for `feature_update`
/// broadcast (§4.7).
pub fn changed_feature_updates(cached: &FeatureList, updated: &FeatureList) -> Vec<(String, bool)> {
    updated
        .features
        .iter()
        .filter(|f| {
            cached
                .features
                .iter()
                .find(|c| c.id == f.id)
                .map(|c| feature_key(c) != feature_key(f))
                .unwrap_or(true)
        })
        .map(|f| (f.id.clone(), f.passes))
        .collect()
}

/// Read `feature_list.json` (bare array or `{features: [...]}`) from
/// `project_dir` and diff it against `cached`. Missing file reads as empty.
pub fn sync_once(project_dir: &Path, cached: &FeatureList) -> std::io::Result<SyncOutcome> {
    let path = project_dir.join("feature_list.json");
    let on_disk = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        FeatureList::parse(&content).unwrap_or_default()
    } else {
        FeatureList::default()
    };

    let changed = on_disk.features.len() != cached.features.len()
        || on_disk.features.iter().any(|f| {
            cached
                .features
                .iter()
                .find(|c| c.id == f.id)
                .map(|c| feature_key(c) != feature_key(f))
                .unwrap_or(true)
        });

    let (total, passed) = on_disk.counts();
    let percentage = if total == 0 { 0.0 } else { (passed as f64 / total as f64) * 100.0 };
    let all_done = on_disk.all_done();

    Ok(SyncOutcome { features: on_disk, changed, total, passed, percentage, all_done })
}

/// Spawn the periodic reconciler. Stops when `stop_rx` observes `true`.
/// `on_all_done` fires (at most once) the first tick that observes 100%
/// progress; the orchestrator uses it to transition the project and request
/// agent stop.
pub fn spawn(
    project_id: String,
    project_dir: std::path::PathBuf,
    persistence: Arc<Persistence>,
    hub: Arc<BroadcastHub>,
    interval_secs: u64,
    mut stop_rx: watch::Receiver<bool>,
    on_all_done: impl Fn(&str) + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        let mut completed_fired = false;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cached = persistence.load_features(&project_id).unwrap_or_default();
                    let outcome = match sync_once(&project_dir, &cached) {
                        Ok(o) => o,
                        Err(_) => continue,
                    };

                    if outcome.changed {
                        for (feature_id, passes) in changed_feature_updates(&cached, &outcome.features) {
                            hub.publish(&project_id, Message::FeatureUpdate { feature_id, passes });
                        }
                        let _ = persistence.save_features(&project_id, &outcome.features);
                        hub.publish(&project_id, Message::FeaturesSync(outcome.features.features.clone()));
                    }
                    hub.publish(
                        &project_id,
                        Message::Progress { total: outcome.total, passed: outcome.passed, percentage: outcome.percentage },
                    );

                    if outcome.all_done && !completed_fired {
                        completed_fired = true;
                        on_all_done(&project_id);
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: &str, passes: bool, in_progress: bool) -> Feature {
        Feature {
            id: id.into(),
            category: "c".into(),
            description: "d".into(),
            steps: vec![],
            passes,
            in_progress,
            fail_count: None,
            last_attempt_at: None,
        }
    }

    #[test]
    fn sync_once_missing_file_is_empty_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = sync_once(dir.path(), &FeatureList::default()).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.total, 0);
        assert!(!outcome.all_done);
    }

    #[test]
    fn sync_once_detects_count_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("feature_list.json"),
            serde_json::to_string(&vec![feature("f1", false, false)]).unwrap(),
        )
        .unwrap();
        let outcome = sync_once(dir.path(), &FeatureList::default()).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.total, 1);
    }

    #[test]
    fn sync_once_detects_status_flip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("feature_list.json"),
            serde_json::to_string(&vec![feature("f1", true, false)]).unwrap(),
        )
        .unwrap();
        let cached = FeatureList { features: vec![feature("f1", false, false)] };
        let outcome = sync_once(dir.path(), &cached).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.passed, 1);
    }

    #[test]
    fn sync_once_no_change_when_identical() {
        let dir = tempfile::tempdir().unwrap();
        let list = vec![feature("f1", true, false)];
        std::fs::write(dir.path().join("feature_list.json"), serde_json::to_string(&list).unwrap()).unwrap();
        let cached = FeatureList { features: list };
        let outcome = sync_once(dir.path(), &cached).unwrap();
        assert!(!outcome.changed);
    }

    #[test]
    fn sync_once_parses_wrapped_object_form() {
        let dir = tempfile::tempdir().unwrap();
        let wrapped = FeatureList { features: vec![feature("f1", false, false)] };
        std::fs::write(
            dir.path().join("feature_list.json"),
            serde_json::to_string(&wrapped).unwrap(),
        )
        .unwrap();
        let outcome = sync_once(dir.path(), &FeatureList::default()).unwrap();
        assert_eq!(outcome.total, 1);
    }

    #[test]
    fn sync_once_all_done_when_all_pass() {
        let dir = tempfile::tempdir().unwrap();
        let list = vec![feature("f1", true, false), feature("f2", true, false)];
        std::fs::write(dir.path().join("feature_list.json"), serde_json::to_string(&list).unwrap()).unwrap();
        let outcome = sync_once(dir.path(), &FeatureList::default()).unwrap();
        assert!(outcome.all_done);
        assert_eq!(outcome.percentage, 100.0);
    }

    #[tokio::test]
    async fn spawned_watcher_broadcasts_progress_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(Persistence::new(data_dir.path()));
        let hub = Arc::new(BroadcastHub::new());
        let mut rx = hub.subscribe("p1");

        let list = vec![feature("f1", true, false)];
        std::fs::write(dir.path().join("feature_list.json"), serde_json::to_string(&list).unwrap()).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        let handle = spawn(
            "p1".into(),
            dir.path().to_path_buf(),
            persistence,
            Arc::clone(&hub),
            1,
            stop_rx,
            move |_| fired_clone.store(true, std::sync::atomic::Ordering::SeqCst),
        );

        // First tick should publish feature_update + features_sync + progress.
        let msg1 = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let msg2 = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let msg3 = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg1.message, Message::FeatureUpdate { feature_id: "f1".into(), passes: true });
        assert!(matches!(msg2.message, Message::FeaturesSync(_)));
        assert!(matches!(msg3.message, Message::Progress { .. }));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn changed_feature_updates_reports_new_and_flipped_features() {
        let cached = FeatureList { features: vec![feature("f1", false, false), feature("f2", true, false)] };
        let updated = FeatureList {
            features: vec![feature("f1", true, false), feature("f2", true, false), feature("f3", false, true)],
        };
        let mut changes = changed_feature_updates(&cached, &updated);
        changes.sort();
        assert_eq!(changes, vec![("f1".to_string(), true), ("f3".to_string(), false)]);
    }

    #[test]
    fn changed_feature_updates_empty_when_nothing_changed() {
        let list = FeatureList { features: vec![feature("f1", true, false)] };
        assert!(changed_feature_updates(&list, &list).is_empty());
    }
}
