use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, ListParams};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::k8s::KubernetesApi;
use crate::labels::DOMAIN_UID_LABEL;
use crate::pod::{is_failed, is_ready, pod_name};

/// Bridges fiber suspension to pod watch events: a step registers a waiter
/// for "ready" or "deleted" on a pod name and parks; the watch loop wakes
/// it. Registration double-checks the live state with a GET so a waiter
/// registered after the event cannot hang; a periodic re-list reconciles
/// anything the stream dropped. Clones share one waiter registry.
#[derive(Clone)]
pub struct PodAwaiter {
    inner: Arc<AwaiterInner>,
}

struct AwaiterInner {
    api: Arc<dyn KubernetesApi>,
    namespace: String,
    entries: Mutex<HashMap<String, Arc<PodEntry>>>,
}

/// Waiter lists for one pod name, behind their own lock so firing one pod
/// never contends with registrations on another.
#[derive(Default)]
struct PodEntry {
    lists: Mutex<WaiterLists>,
}

#[derive(Default)]
struct WaiterLists {
    ready: Vec<Waiter>,
    deleted: Vec<Waiter>,
}

type Waiter = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy)]
enum WaiterKind {
    Ready,
    Deleted,
}

/// Watch stream events, decoupled from the kube stream so tests and the
/// re-list path feed the same entry point.
pub enum PodWatchEvent {
    Applied(corev1::Pod),
    Deleted(corev1::Pod),
    Relisted(Vec<corev1::Pod>),
}

impl PodAwaiter {
    pub fn new(api: Arc<dyn KubernetesApi>, namespace: &str) -> PodAwaiter {
        PodAwaiter {
            inner: Arc::new(AwaiterInner {
                api,
                namespace: namespace.to_string(),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Calls `waiter` once the pod is Running and Ready, or has entered
    /// the Failed phase; the woken step classifies which.
    pub fn wait_for_ready(&self, name: &str, waiter: impl FnOnce() + Send + 'static) {
        self.inner.register(name, WaiterKind::Ready, Box::new(waiter));

        let inner = self.inner.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            match inner.api.read_pod(&inner.namespace, &name).await {
                Ok(Some(pod)) if is_ready(&pod) || is_failed(&pod) => {
                    inner.fire_ready(&name);
                }
                Ok(_) => {}
                Err(e) => debug!(pod = %name, error = %e, "initial readiness check failed"),
            }
        });
    }

    /// Calls `waiter` once the watcher observes the pod deleted; an
    /// initial GET answering 404 counts.
    pub fn wait_for_deleted(&self, name: &str, waiter: impl FnOnce() + Send + 'static) {
        self.inner
            .register(name, WaiterKind::Deleted, Box::new(waiter));

        let inner = self.inner.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            match inner.api.read_pod(&inner.namespace, &name).await {
                Ok(None) => inner.fire_deleted(&name),
                Ok(Some(_)) => {}
                Err(e) => debug!(pod = %name, error = %e, "initial deletion check failed"),
            }
        });
    }

    pub fn on_event(&self, event: PodWatchEvent) {
        match event {
            PodWatchEvent::Applied(pod) => {
                if is_ready(&pod) || is_failed(&pod) {
                    self.inner.fire_ready(pod_name(&pod));
                }
            }
            PodWatchEvent::Deleted(pod) => {
                self.inner.fire_deleted(pod_name(&pod));
            }
            PodWatchEvent::Relisted(pods) => self.inner.reconcile_after_relist(&pods),
        }
    }

    /// Consumes the namespace's pod watch stream. The watcher re-lists on
    /// reconnect, which surfaces here as a `Restarted` event and sweeps
    /// any waiters whose events were lost.
    pub fn spawn_watch(&self, client: Client) -> JoinHandle<()> {
        let awaiter = self.clone();
        let pods: Api<corev1::Pod> = Api::namespaced(client, &self.inner.namespace);
        let lp = ListParams::default().labels(DOMAIN_UID_LABEL);
        tokio::spawn(async move {
            let mut stream = watcher::watcher(pods, lp).boxed();
            loop {
                match stream.next().await {
                    Some(Ok(Event::Applied(pod))) => {
                        awaiter.on_event(PodWatchEvent::Applied(pod));
                    }
                    Some(Ok(Event::Deleted(pod))) => {
                        awaiter.on_event(PodWatchEvent::Deleted(pod));
                    }
                    Some(Ok(Event::Restarted(pods))) => {
                        awaiter.on_event(PodWatchEvent::Relisted(pods));
                    }
                    Some(Err(e)) => {
                        warn!(namespace = %awaiter.inner.namespace, error = %e, "pod watch error, stream will resync");
                    }
                    None => break,
                }
            }
        })
    }
}

impl AwaiterInner {
    /// Registration holds the registry lock across the push so a
    /// concurrent fire cannot prune the entry out from under it.
    fn register(&self, name: &str, kind: WaiterKind, waiter: Waiter) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PodEntry::default()));
        let mut lists = entry.lists.lock().unwrap();
        match kind {
            WaiterKind::Ready => lists.ready.push(waiter),
            WaiterKind::Deleted => lists.deleted.push(waiter),
        }
    }

    /// Drains the matching waiters; an entry left with no waiters at all
    /// is removed so the registry never outgrows the pods still waited
    /// on. Locks are released before the drained waiters run.
    fn drain(&self, name: &str, kind: WaiterKind) -> Vec<Waiter> {
        let mut entries = self.entries.lock().unwrap();
        let entry = match entries.get(name) {
            Some(entry) => entry.clone(),
            None => return Vec::new(),
        };
        let mut lists = entry.lists.lock().unwrap();
        let waiters = match kind {
            WaiterKind::Ready => std::mem::take(&mut lists.ready),
            WaiterKind::Deleted => std::mem::take(&mut lists.deleted),
        };
        let emptied = lists.ready.is_empty() && lists.deleted.is_empty();
        drop(lists);
        if emptied {
            entries.remove(name);
        }
        waiters
    }

    fn fire_ready(&self, name: &str) {
        for waiter in self.drain(name, WaiterKind::Ready) {
            waiter();
        }
    }

    fn fire_deleted(&self, name: &str) {
        for waiter in self.drain(name, WaiterKind::Deleted) {
            waiter();
        }
    }

    fn reconcile_after_relist(&self, pods: &[corev1::Pod]) {
        let names: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        for name in names {
            match pods.iter().find(|p| pod_name(p) == name) {
                None => self.fire_deleted(&name),
                Some(pod) if is_ready(pod) || is_failed(pod) => self.fire_ready(&name),
                Some(_) => {}
            }
        }
    }
}
