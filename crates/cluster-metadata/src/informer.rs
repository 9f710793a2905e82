//! Shared informers.
//!
//! A `SharedInformer` owns one list+watch stream for a resource kind, mirrors
//! it into a `reflector` store and fans the changes out to every subscriber as
//! `Added` / `Updated` / `Deleted` events. Informers are created lazily through
//! the `InformerFactory` and only begin consuming their stream once the factory
//! is started, so every subscription registered before `start` sees the full
//! initial listing.

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::{Api, Client, Resource};
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{watcher, WatchStreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resource kinds an informer can watch.
pub trait WatchedResource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> WatchedResource for K where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// Raw list+watch stream consumed by an informer.
pub type EventStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// Opens list+watch streams. Reconnection and backoff are the source's concern.
pub trait WatchSource: Send + Sync + 'static {
    /// Opens a cluster-wide watch for `K`.
    fn watch<K: WatchedResource>(&self) -> EventStream<K>;
}

impl WatchSource for Client {
    fn watch<K: WatchedResource>(&self) -> EventStream<K> {
        watcher(Api::<K>::all(self.clone()), watcher::Config::default())
            .default_backoff()
            .boxed()
    }
}

/// A change delivered to informer subscribers.
#[derive(Debug)]
pub enum WatchEvent<K> {
    /// First time the object is seen
    Added(Arc<K>),
    /// Object already cached and changed (or re-listed)
    Updated(Arc<K>),
    /// Object removed from the cluster
    Deleted(Arc<K>),
}

impl<K> Clone for WatchEvent<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Added(obj) => Self::Added(Arc::clone(obj)),
            Self::Updated(obj) => Self::Updated(Arc::clone(obj)),
            Self::Deleted(obj) => Self::Deleted(Arc::clone(obj)),
        }
    }
}

/// Anything that can report whether its initial listing completed.
pub trait HasSynced: Send + Sync {
    /// True once the initial listing has been fully applied.
    fn has_synced(&self) -> bool;
}

/// Objects cached before a relist, used to detect deletions missed while the
/// watch was disconnected.
struct Relist<K: WatchedResource> {
    previous: Vec<Arc<K>>,
    seen: HashSet<ObjectRef<K>>,
}

/// One watched resource kind shared by any number of subscribers.
pub struct SharedInformer<K: WatchedResource> {
    kind: &'static str,
    writer: Mutex<Option<Writer<K>>>,
    store: Store<K>,
    subscribers: Mutex<Vec<UnboundedSender<WatchEvent<K>>>>,
    started: AtomicBool,
    synced: AtomicBool,
}

impl<K: WatchedResource> SharedInformer<K> {
    /// Creates an idle informer for `kind`.
    pub fn new(kind: &'static str) -> Arc<Self> {
        let writer = Writer::default();
        let store = writer.as_reader();
        Arc::new(Self {
            kind,
            writer: Mutex::new(Some(writer)),
            store,
            subscribers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            synced: AtomicBool::new(false),
        })
    }

    /// Name used in logs and sync reports.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Read handle on the local cache.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// True once the informer has begun consuming its stream.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Registers a subscriber.
    ///
    /// Events dispatched before this call are not replayed.
    pub fn subscribe(&self) -> UnboundedReceiver<WatchEvent<K>> {
        if self.is_started() {
            warn!(
                "Subscribing to the {} informer after dispatch began; earlier events are lost",
                self.kind
            );
        }
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Consumes `source` until it ends or `shutdown` fires.
    ///
    /// Only the first call runs; later calls return immediately.
    pub async fn run<S>(self: Arc<Self>, source: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        match self.claim() {
            Some(writer) => self.drive(writer, source, shutdown).await,
            None => warn!("{} informer is already running", self.kind),
        }
    }

    fn claim(&self) -> Option<Writer<K>> {
        let writer = self.writer.lock().take()?;
        self.started.store(true, Ordering::SeqCst);
        Some(writer)
    }

    async fn drive<S>(&self, mut writer: Writer<K>, source: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        info!("Starting {} informer", self.kind);
        let mut stream = pin!(source);
        let mut relist: Option<Relist<K>> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => self.apply(&mut writer, &mut relist, event),
                Some(Err(e)) => warn!("{} watch error: {}", self.kind, e),
                None => {
                    warn!("{} watch stream ended", self.kind);
                    break;
                }
            }
        }

        info!("{} informer stopped", self.kind);
    }

    fn apply(&self, writer: &mut Writer<K>, relist: &mut Option<Relist<K>>, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Init => {
                debug!("{} informer listing", self.kind);
                *relist = Some(Relist {
                    previous: self.store.state(),
                    seen: HashSet::new(),
                });
                writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                let key = ObjectRef::from_obj(obj);
                let existed = self.store.get(&key).is_some();
                if let (watcher::Event::InitApply(_), Some(relist)) = (&event, relist.as_mut()) {
                    relist.seen.insert(key);
                }
                writer.apply_watcher_event(&event);

                let obj = Arc::new(obj.clone());
                self.dispatch(if existed {
                    WatchEvent::Updated(obj)
                } else {
                    WatchEvent::Added(obj)
                });
            }
            watcher::Event::Delete(obj) => {
                writer.apply_watcher_event(&event);
                self.dispatch(WatchEvent::Deleted(Arc::new(obj.clone())));
            }
            watcher::Event::InitDone => {
                writer.apply_watcher_event(&event);
                if let Some(Relist { previous, seen }) = relist.take() {
                    for gone in previous {
                        if !seen.contains(&ObjectRef::from_obj(gone.as_ref())) {
                            self.dispatch(WatchEvent::Deleted(gone));
                        }
                    }
                }
                if !self.synced.swap(true, Ordering::SeqCst) {
                    info!("{} informer synced", self.kind);
                }
            }
        }
    }

    fn dispatch(&self, event: WatchEvent<K>) {
        self.subscribers
            .lock()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }
}

impl<K: WatchedResource> HasSynced for SharedInformer<K> {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Feeds every event of a subscription to `handle` until the stream ends or
/// `shutdown` fires. An event being handled is always finished first.
pub async fn for_each_event<K, S, F>(kind: &str, mut events: S, shutdown: CancellationToken, mut handle: F)
where
    S: Stream<Item = WatchEvent<K>> + Unpin,
    F: FnMut(WatchEvent<K>),
{
    info!("Processing {} events", kind);
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(event) => handle(event),
            None => break,
        }
    }
    info!("Stopped processing {} events", kind);
}

type Opener<K> = Box<dyn Fn() -> EventStream<K> + Send + Sync>;

/// Lazily created informer of one kind.
struct Slot<K: WatchedResource> {
    kind: &'static str,
    open: Opener<K>,
    informer: OnceLock<Arc<SharedInformer<K>>>,
}

impl<K: WatchedResource> Slot<K> {
    fn new<S: WatchSource>(kind: &'static str, source: Arc<S>) -> Self {
        Self {
            kind,
            open: Box::new(move || source.watch::<K>()),
            informer: OnceLock::new(),
        }
    }

    fn get(&self) -> Arc<SharedInformer<K>> {
        Arc::clone(self.informer.get_or_init(|| SharedInformer::new(self.kind)))
    }

    fn start(&self, shutdown: &CancellationToken) -> Option<JoinHandle<()>> {
        let informer = Arc::clone(self.informer.get()?);
        let writer = informer.claim()?;
        let source = (self.open)();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            informer.drive(writer, source, shutdown).await;
        }))
    }
}

/// Hands out one shared informer per resource kind.
///
/// Informers are only created when a controller asks for them, and only
/// consume their streams once [`InformerFactory::start`] is called.
pub struct InformerFactory {
    nodes: Slot<Node>,
    endpoints: Slot<Endpoints>,
    services: Slot<Service>,
    horizontal_pod_autoscalers: Slot<HorizontalPodAutoscaler>,
}

impl InformerFactory {
    /// Creates a factory whose informers watch through `source`.
    pub fn new<S: WatchSource>(source: S) -> Self {
        let source = Arc::new(source);
        Self {
            nodes: Slot::new("nodes", Arc::clone(&source)),
            endpoints: Slot::new("endpoints", Arc::clone(&source)),
            services: Slot::new("services", Arc::clone(&source)),
            horizontal_pod_autoscalers: Slot::new("hpa", source),
        }
    }

    /// Node informer.
    pub fn nodes(&self) -> Arc<SharedInformer<Node>> {
        self.nodes.get()
    }

    /// Endpoints informer.
    pub fn endpoints(&self) -> Arc<SharedInformer<Endpoints>> {
        self.endpoints.get()
    }

    /// Service informer.
    pub fn services(&self) -> Arc<SharedInformer<Service>> {
        self.services.get()
    }

    /// HorizontalPodAutoscaler informer.
    pub fn horizontal_pod_autoscalers(&self) -> Arc<SharedInformer<HorizontalPodAutoscaler>> {
        self.horizontal_pod_autoscalers.get()
    }

    /// Starts every informer requested so far that is not already running.
    pub fn start(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        [
            self.nodes.start(shutdown),
            self.endpoints.start(shutdown),
            self.services.start(shutdown),
            self.horizontal_pod_autoscalers.start(shutdown),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{node, ChannelSource};
    use std::collections::BTreeMap;

    async fn next_event<K>(rx: &mut UnboundedReceiver<WatchEvent<K>>) -> WatchEvent<K> {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.next())
            .await
            .expect("timed out waiting for event")
            .expect("subscriber closed")
    }

    fn name_of(event: &WatchEvent<Node>) -> (&'static str, String) {
        let (tag, obj) = match event {
            WatchEvent::Added(o) => ("added", o),
            WatchEvent::Updated(o) => ("updated", o),
            WatchEvent::Deleted(o) => ("deleted", o),
        };
        (tag, obj.metadata.name.clone().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_initial_list_then_updates() {
        let informer = SharedInformer::<Node>::new("nodes");
        let mut rx = informer.subscribe();
        let (tx, source) = mpsc::unbounded();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&informer).run(source, shutdown.clone()));

        tx.unbounded_send(Ok(watcher::Event::Init)).unwrap();
        tx.unbounded_send(Ok(watcher::Event::InitApply(node("n1", BTreeMap::new())))).unwrap();
        tx.unbounded_send(Ok(watcher::Event::InitDone)).unwrap();
        assert_eq!(name_of(&next_event(&mut rx).await), ("added", "n1".to_string()));

        tx.unbounded_send(Ok(watcher::Event::Apply(node("n1", BTreeMap::new())))).unwrap();
        assert_eq!(name_of(&next_event(&mut rx).await), ("updated", "n1".to_string()));
        assert!(informer.has_synced());
        assert_eq!(informer.store().state().len(), 1);

        tx.unbounded_send(Ok(watcher::Event::Delete(node("n1", BTreeMap::new())))).unwrap();
        assert_eq!(name_of(&next_event(&mut rx).await), ("deleted", "n1".to_string()));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_relist_emits_missed_deletes() {
        let informer = SharedInformer::<Node>::new("nodes");
        let mut rx = informer.subscribe();
        let (tx, source) = mpsc::unbounded();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&informer).run(source, shutdown.clone()));

        for event in [
            watcher::Event::Init,
            watcher::Event::InitApply(node("n1", BTreeMap::new())),
            watcher::Event::InitApply(node("n2", BTreeMap::new())),
            watcher::Event::InitDone,
        ] {
            tx.unbounded_send(Ok(event)).unwrap();
        }
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        // reconnect: n2 disappeared while the watch was down
        for event in [
            watcher::Event::Init,
            watcher::Event::InitApply(node("n1", BTreeMap::new())),
            watcher::Event::InitDone,
        ] {
            tx.unbounded_send(Ok(event)).unwrap();
        }
        assert_eq!(name_of(&next_event(&mut rx).await), ("updated", "n1".to_string()));
        assert_eq!(name_of(&next_event(&mut rx).await), ("deleted", "n2".to_string()));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_factory_starts_only_requested_informers() {
        let source = ChannelSource::default();
        let nodes_tx = source.channel::<Node>();
        let factory = InformerFactory::new(source);
        let shutdown = CancellationToken::new();

        let nodes = factory.nodes();
        let mut rx = nodes.subscribe();
        let handles = factory.start(&shutdown);
        assert_eq!(handles.len(), 1);
        assert!(nodes.is_started());

        nodes_tx.unbounded_send(Ok(watcher::Event::Apply(node("n1", BTreeMap::new())))).unwrap();
        assert_eq!(name_of(&next_event(&mut rx).await), ("added", "n1".to_string()));

        // a second start does not spawn the running informer again
        assert!(factory.start(&shutdown).is_empty());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
