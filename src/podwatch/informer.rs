use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};
use crate::podwatch::store::PodStore;
use crate::types::{PodKey, PodSnapshot};

/// Receives pod notifications. Callbacks run inline on the informer task and
/// must not block.
pub trait PodEventHandler: Send + Sync {
    fn on_add(&self, pod: &PodSnapshot);
    fn on_update(&self, old: &PodSnapshot, new: &PodSnapshot);
    fn on_delete(&self, pod: &DeletedPod);
}

/// A removed pod. `Tombstone` carries the last state we saw when the deletion
/// itself was missed and only noticed on a relist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletedPod {
    Live(PodSnapshot),
    Tombstone(PodSnapshot),
}

impl DeletedPod {
    pub fn snapshot(&self) -> &PodSnapshot {
        match self {
            DeletedPod::Live(pod) | DeletedPod::Tombstone(pod) => pod,
        }
    }

    pub fn key(&self) -> &PodKey {
        &self.snapshot().key
    }
}

/// Field selector limiting a pod watch to one node.
pub fn node_field_selector(node: &str) -> String {
    format!("spec.nodeName={node}")
}

/// Keeps a [`PodStore`] in step with a pod watch and turns the watch into
/// add/update/delete callbacks.
pub struct PodInformer {
    node_name: String,
    store: PodStore,
    handler: Arc<dyn PodEventHandler>,
    resync: Option<Duration>,
    /// Objects collected during an in-progress (re)list.
    relist: Option<HashMap<PodKey, PodSnapshot>>,
    synced: watch::Sender<bool>,
}

impl PodInformer {
    /// The returned receiver flips to `true` once the first full list has
    /// been applied to the store.
    pub fn new(
        node_name: impl Into<String>,
        store: PodStore,
        handler: Arc<dyn PodEventHandler>,
        resync: Option<Duration>,
    ) -> (Self, watch::Receiver<bool>) {
        let (synced, rx) = watch::channel(false);
        let informer = Self {
            node_name: node_name.into(),
            store,
            handler,
            resync,
            relist: None,
            synced,
        };
        (informer, rx)
    }

    /// Watches pods scheduled on this node until `shutdown` fires.
    pub async fn run(mut self, api: Api<Pod>, shutdown: CancellationToken) -> AppResult<()> {
        let selector = node_field_selector(&self.node_name);
        tracing::info!(selector = %selector, "starting pod informer");

        let stream = watcher(api, watcher::Config::default().fields(&selector)).default_backoff();
        pin_mut!(stream);

        let mut resync = self.resync.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("pod informer stopping");
                    return Ok(());
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => tracing::warn!(error = %e, "pod watch error; retrying"),
                    None => return Err(AppError::Other("pod watch stream ended".to_string())),
                },
                _ = tick(resync.as_mut()) => self.resync_all(),
            }
        }
    }

    pub fn apply(&mut self, event: Event<Pod>) {
        match event {
            Event::Init => {
                tracing::debug!("pod list started");
                self.relist = Some(HashMap::new());
            }
            Event::InitApply(pod) => {
                let snap = PodSnapshot::from_pod(&pod);
                if !snap.is_scheduled_on(&self.node_name) {
                    return;
                }
                match self.relist.as_mut() {
                    Some(listed) => {
                        listed.insert(snap.key.clone(), snap);
                    }
                    None => self.upsert(snap),
                }
            }
            Event::InitDone => self.finish_relist(),
            Event::Apply(pod) => {
                let snap = PodSnapshot::from_pod(&pod);
                if snap.is_scheduled_on(&self.node_name) {
                    self.upsert(snap);
                } else if let Some(old) = self.store.remove(&snap.key) {
                    self.dispatch_delete(DeletedPod::Live(old.as_ref().clone()));
                }
            }
            Event::Delete(pod) => {
                let snap = PodSnapshot::from_pod(&pod);
                let known = self.store.remove(&snap.key).is_some();
                if known || snap.is_scheduled_on(&self.node_name) {
                    self.dispatch_delete(DeletedPod::Live(snap));
                }
            }
        }
    }

    /// Re-delivers every cached pod as an update to itself.
    pub fn resync_all(&self) {
        for pod in self.store.list() {
            self.dispatch(&pod.key, "update", |h| h.on_update(&pod, &pod));
        }
    }

    fn upsert(&self, snap: PodSnapshot) {
        let new = Arc::new(snap);
        match self.store.insert(Arc::clone(&new)) {
            Some(old) => self.dispatch(&new.key, "update", |h| h.on_update(&old, &new)),
            None => self.dispatch(&new.key, "add", |h| h.on_add(&new)),
        }
    }

    fn finish_relist(&mut self) {
        let Some(listed) = self.relist.take() else {
            return;
        };

        for key in self.store.keys() {
            if listed.contains_key(&key) {
                continue;
            }
            if let Some(old) = self.store.remove(&key) {
                tracing::debug!(namespace = %key.namespace, pod = %key.name, "pod vanished during relist");
                self.dispatch_delete(DeletedPod::Tombstone(old.as_ref().clone()));
            }
        }

        let count = listed.len();
        for snap in listed.into_values() {
            self.upsert(snap);
        }

        if self.synced.send_if_modified(|synced| !std::mem::replace(synced, true)) {
            tracing::info!(pods = count, "pod cache synced");
        } else {
            tracing::debug!(pods = count, "pod relist applied");
        }
    }

    fn dispatch_delete(&self, deleted: DeletedPod) {
        let key = deleted.key().clone();
        self.dispatch(&key, "delete", |h| h.on_delete(&deleted));
    }

    /// Runs one callback, containing any panic so the watch keeps going.
    fn dispatch(&self, key: &PodKey, event: &'static str, f: impl FnOnce(&dyn PodEventHandler)) {
        let handler = self.handler.as_ref();
        if panic::catch_unwind(AssertUnwindSafe(|| f(handler))).is_err() {
            tracing::error!(
                event,
                namespace = %key.namespace,
                pod = %key.name,
                "pod event handler panicked"
            );
        }
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CAPTURE_ANNOTATION;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Add(String),
        Update(String, Option<String>, Option<String>),
        Delete(String, bool),
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Seen>>,
        panic_on_add: Option<&'static str>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl PodEventHandler for Recorder {
        fn on_add(&self, pod: &PodSnapshot) {
            if self.panic_on_add == Some(pod.key.name.as_str()) {
                panic!("handler blew up");
            }
            self.seen.lock().unwrap().push(Seen::Add(pod.key.to_string()));
        }

        fn on_update(&self, old: &PodSnapshot, new: &PodSnapshot) {
            self.seen.lock().unwrap().push(Seen::Update(
                new.key.to_string(),
                old.resource_version.clone(),
                new.resource_version.clone(),
            ));
        }

        fn on_delete(&self, pod: &DeletedPod) {
            let tombstone = matches!(pod, DeletedPod::Tombstone(_));
            self.seen
                .lock()
                .unwrap()
                .push(Seen::Delete(pod.key().to_string(), tombstone));
        }
    }

    fn pod(name: &str, node: &str, rv: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                resource_version: Some(rv.to_string()),
                annotations: Some(
                    [(CAPTURE_ANNOTATION.to_string(), "3".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn informer(recorder: Arc<Recorder>) -> (PodInformer, PodStore, watch::Receiver<bool>) {
        let store = PodStore::default();
        let (informer, synced) = PodInformer::new("node-1", store.clone(), recorder, None);
        (informer, store, synced)
    }

    fn initial_list(informer: &mut PodInformer, pods: Vec<Pod>) {
        informer.apply(Event::Init);
        for p in pods {
            informer.apply(Event::InitApply(p));
        }
        informer.apply(Event::InitDone);
    }

    #[test]
    fn initial_list_populates_store_then_signals_sync() {
        let recorder = Arc::new(Recorder::default());
        let (mut inf, store, synced) = informer(recorder.clone());

        inf.apply(Event::Init);
        inf.apply(Event::InitApply(pod("a", "node-1", "1")));
        inf.apply(Event::InitApply(pod("b", "node-1", "1")));
        assert!(!*synced.borrow(), "not synced before the list completes");
        assert!(store.is_empty(), "store is replaced only once the list completes");

        inf.apply(Event::InitDone);
        assert!(*synced.borrow());
        assert_eq!(store.len(), 2);

        let mut seen = recorder.seen();
        seen.sort_by_key(|s| format!("{s:?}"));
        assert_eq!(seen, vec![Seen::Add("ns/a".into()), Seen::Add("ns/b".into())]);
    }

    #[test]
    fn apply_and_delete_dispatch_update_and_live_delete() {
        let recorder = Arc::new(Recorder::default());
        let (mut inf, store, _synced) = informer(recorder.clone());
        initial_list(&mut inf, vec![pod("a", "node-1", "1")]);

        inf.apply(Event::Apply(pod("a", "node-1", "2")));
        inf.apply(Event::Apply(pod("c", "node-1", "5")));
        inf.apply(Event::Delete(pod("a", "node-1", "3")));

        assert_eq!(
            recorder.seen(),
            vec![
                Seen::Add("ns/a".into()),
                Seen::Update("ns/a".into(), Some("1".into()), Some("2".into())),
                Seen::Add("ns/c".into()),
                Seen::Delete("ns/a".into(), false),
            ]
        );
        assert_eq!(store.keys(), vec![PodKey::new("ns", "c")]);
    }

    #[test]
    fn relist_turns_missed_deletes_into_tombstones() {
        let recorder = Arc::new(Recorder::default());
        let (mut inf, store, _synced) = informer(recorder.clone());
        initial_list(&mut inf, vec![pod("a", "node-1", "1"), pod("b", "node-1", "1")]);

        initial_list(&mut inf, vec![pod("b", "node-1", "7")]);

        let seen = recorder.seen();
        assert!(seen.contains(&Seen::Delete("ns/a".into(), true)));
        assert!(seen.contains(&Seen::Update("ns/b".into(), Some("1".into()), Some("7".into()))));
        assert_eq!(store.keys(), vec![PodKey::new("ns", "b")]);
    }

    #[test]
    fn resync_redelivers_identical_snapshots() {
        let recorder = Arc::new(Recorder::default());
        let (mut inf, _store, _synced) = informer(recorder.clone());
        initial_list(&mut inf, vec![pod("a", "node-1", "4")]);

        inf.resync_all();

        assert_eq!(
            recorder.seen().last(),
            Some(&Seen::Update("ns/a".into(), Some("4".into()), Some("4".into())))
        );
    }

    #[test]
    fn panicking_handler_does_not_stop_dispatch() {
        let recorder = Arc::new(Recorder {
            panic_on_add: Some("boom"),
            ..Default::default()
        });
        let (mut inf, store, _synced) = informer(recorder.clone());
        initial_list(&mut inf, vec![]);

        inf.apply(Event::Apply(pod("boom", "node-1", "1")));
        inf.apply(Event::Apply(pod("fine", "node-1", "1")));

        assert_eq!(store.len(), 2);
        assert_eq!(recorder.seen(), vec![Seen::Add("ns/fine".into())]);
    }

    #[test]
    fn pod_leaving_the_node_is_deleted() {
        let recorder = Arc::new(Recorder::default());
        let (mut inf, store, _synced) = informer(recorder.clone());
        initial_list(&mut inf, vec![pod("a", "node-1", "1")]);

        inf.apply(Event::Apply(pod("a", "node-2", "2")));

        assert!(store.is_empty());
        assert_eq!(recorder.seen().last(), Some(&Seen::Delete("ns/a".into(), false)));
    }

    proptest! {
        #[test]
        fn selector_targets_exactly_the_node_name(node in "[a-z0-9]([-a-z0-9.]{0,30}[a-z0-9])?") {
            let selector = node_field_selector(&node);
            let (field, value) = selector.split_once('=').unwrap();
            prop_assert_eq!(field, "spec.nodeName");
            prop_assert_eq!(value, node.as_str());
        }

        #[test]
        fn only_pods_on_the_local_node_are_cached(
            pods in proptest::collection::vec(
                ("[a-z][a-z0-9]{0,8}", prop_oneof![Just("node-1"), Just("node-2"), Just("node-3")]),
                0..20,
            )
        ) {
            let recorder = Arc::new(Recorder::default());
            let (mut inf, store, _synced) = informer(recorder);

            let mut expected: Vec<PodKey> = pods
                .iter()
                .filter(|(_, node)| *node == "node-1")
                .map(|(name, _)| PodKey::new("ns", name.clone()))
                .collect();
            expected.sort();
            expected.dedup();

            initial_list(&mut inf, pods.iter().map(|(name, node)| pod(name, node, "1")).collect());

            let mut cached = store.keys();
            cached.sort();
            prop_assert_eq!(cached, expected);
            prop_assert!(store.list().iter().all(|p| p.is_scheduled_on("node-1")));
        }
    }
}
