//! Node and pod metadata cache.
//!
//! The aggregator keeps two bundles fed by informer events:
//! - node labels, keyed by node name (written by the Node event loop)
//! - service tags per pod, keyed by node then `(namespace, pod)` (written by
//!   the Endpoints event loop)
//!
//! Each bundle sits behind its own lock. Writers replace one node's or one
//! service's data under the write lock, so a reader never sees half of an
//! update, and whole-bundle reads see a single instant. Pods whose last tag is
//! removed are dropped, so an untagged pod reads as not found.

use crate::error::ControllerError;
use crate::informer::{for_each_event, WatchEvent};
use futures::Stream;
use k8s_openapi::api::core::v1::{Endpoints, Node};
use kube_runtime::reflector::Store;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prefix of the tag attached to every pod backing a service.
pub const SERVICE_TAG_PREFIX: &str = "kube_service:";

/// Pod tags on one node: namespace → pod → tags.
pub type PodTags = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// Identifies a namespaced object (a pod or a service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Builds a key from borrowed parts.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// A pod backing a service, located on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Backend {
    node: String,
    pod: ObjectKey,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct NodeTagBundle {
    labels: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PodTagBundle {
    nodes: HashMap<String, HashMap<ObjectKey, BTreeSet<String>>>,
    // service → backends it tagged last time, so removals can be retracted
    services: HashMap<ObjectKey, HashSet<Backend>>,
}

impl PodTagBundle {
    fn tag(&mut self, backend: &Backend, tag: &str) {
        self.nodes
            .entry(backend.node.clone())
            .or_default()
            .entry(backend.pod.clone())
            .or_default()
            .insert(tag.to_string());
    }

    fn untag(&mut self, backend: &Backend, tag: &str) {
        let Some(pods) = self.nodes.get_mut(&backend.node) else {
            return;
        };
        if let Some(tags) = pods.get_mut(&backend.pod) {
            tags.remove(tag);
            if tags.is_empty() {
                pods.remove(&backend.pod);
            }
        }
        if pods.is_empty() {
            self.nodes.remove(&backend.node);
        }
    }

    fn pod_tags(&self, node: &str) -> Option<PodTags> {
        let pods = self.nodes.get(node)?;
        let mut out = PodTags::new();
        for (pod, tags) in pods {
            out.entry(pod.namespace.clone())
                .or_default()
                .insert(pod.name.clone(), tags.iter().cloned().collect());
        }
        Some(out)
    }
}

/// Pods of one node, with a warning when the node is not cached at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePods {
    /// namespace → pod → tags, possibly empty
    pub pods: PodTags,
    /// Set when nothing is cached for the node
    pub warning: Option<String>,
}

/// Snapshot of every node's pod tags.
///
/// `errors` holds one message per node whose data could not be computed;
/// the other nodes are still complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterMetadata {
    /// node → namespace → pod → tags
    pub nodes: BTreeMap<String, PodTags>,
    /// node → error message
    pub errors: BTreeMap<String, String>,
}

impl ClusterMetadata {
    /// True when at least one node failed.
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Source of the authoritative node list used by whole-cluster queries.
pub trait NodeLister: Send + Sync {
    /// Names of every node currently known to the cluster.
    fn list_nodes(&self) -> Result<Vec<String>, ControllerError>;
}

impl NodeLister for Store<Node> {
    fn list_nodes(&self) -> Result<Vec<String>, ControllerError> {
        Ok(self
            .state()
            .iter()
            .filter_map(|node| node.metadata.name.clone())
            .collect())
    }
}

/// Read side of the metadata cache, as consumed by the query API.
pub trait MetadataQuery: Send + Sync {
    /// Tags of one pod, `None` when the pod is not cached.
    fn pod_tags(&self, node: &str, namespace: &str, pod: &str) -> Result<Option<Vec<String>>, ControllerError>;

    /// Labels of one node, `None` when the node is not cached.
    fn node_labels(&self, node: &str) -> Result<Option<Vec<String>>, ControllerError>;

    /// Every pod of one node.
    fn pods_on_node(&self, node: &str) -> Result<NodePods, ControllerError>;

    /// Every node of the cluster.
    fn all(&self) -> Result<ClusterMetadata, ControllerError>;
}

/// Aggregates Node and Endpoints events into queryable tag bundles.
#[derive(Default)]
pub struct MetadataAggregator {
    node_bundle: RwLock<NodeTagBundle>,
    pod_bundle: RwLock<PodTagBundle>,
    node_lister: RwLock<Option<Arc<dyn NodeLister>>>,
}

impl MetadataAggregator {
    /// Creates an aggregator with empty bundles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets where whole-cluster queries get their node list from.
    pub fn set_node_lister(&self, lister: Arc<dyn NodeLister>) {
        *self.node_lister.write() = Some(lister);
    }

    /// Recomputes a node's labels and replaces its entry.
    pub fn apply_node(&self, node: &Node) {
        let Some(name) = node.metadata.name.as_deref() else {
            warn!("Ignoring node without a name");
            return;
        };
        let labels: BTreeSet<String> = node
            .metadata
            .labels
            .iter()
            .flatten()
            .map(|(key, value)| format!("{}:{}", key, value))
            .collect();

        debug!("Caching {} labels for node {}", labels.len(), name);
        self.node_bundle.write().labels.insert(name.to_string(), labels);
    }

    /// Drops a node's labels.
    pub fn delete_node(&self, node: &Node) {
        if let Some(name) = node.metadata.name.as_deref() {
            debug!("Removing labels of deleted node {}", name);
            self.node_bundle.write().labels.remove(name);
        }
    }

    /// Tags the pods backing a service and untags pods it no longer selects.
    pub fn apply_endpoints(&self, endpoints: &Endpoints) {
        let Some(service) = service_key(endpoints) else {
            warn!("Ignoring endpoints without a name or namespace");
            return;
        };
        let tag = service_tag(&service.name);
        let current = backends(endpoints, &service.namespace);

        let mut bundle = self.pod_bundle.write();
        let previous = bundle.services.remove(&service).unwrap_or_default();
        for stale in previous.difference(&current) {
            bundle.untag(stale, &tag);
        }
        for backend in &current {
            bundle.tag(backend, &tag);
        }
        debug!(
            "Service {}/{} tags {} pods",
            service.namespace,
            service.name,
            current.len()
        );
        if !current.is_empty() {
            bundle.services.insert(service, current);
        }
    }

    /// Removes a service's tag from every pod it was attached to.
    pub fn delete_endpoints(&self, endpoints: &Endpoints) {
        let Some(service) = service_key(endpoints) else {
            return;
        };
        let tag = service_tag(&service.name);

        let mut bundle = self.pod_bundle.write();
        if let Some(previous) = bundle.services.remove(&service) {
            for backend in &previous {
                bundle.untag(backend, &tag);
            }
            debug!("Service {}/{} deleted, untagged {} pods", service.namespace, service.name, previous.len());
        }
    }

    /// Applies one Node informer event.
    pub fn handle_node_event(&self, event: &WatchEvent<Node>) {
        match event {
            WatchEvent::Added(node) | WatchEvent::Updated(node) => self.apply_node(node),
            WatchEvent::Deleted(node) => self.delete_node(node),
        }
    }

    /// Applies one Endpoints informer event.
    pub fn handle_endpoints_event(&self, event: &WatchEvent<Endpoints>) {
        match event {
            WatchEvent::Added(endpoints) | WatchEvent::Updated(endpoints) => self.apply_endpoints(endpoints),
            WatchEvent::Deleted(endpoints) => self.delete_endpoints(endpoints),
        }
    }

    /// Consumes Node events until the stream ends or `shutdown` fires.
    pub async fn run_node_events<S>(self: Arc<Self>, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = WatchEvent<Node>> + Unpin,
    {
        for_each_event("node", events, shutdown, |event| self.handle_node_event(&event)).await;
    }

    /// Consumes Endpoints events until the stream ends or `shutdown` fires.
    pub async fn run_endpoints_events<S>(self: Arc<Self>, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = WatchEvent<Endpoints>> + Unpin,
    {
        for_each_event("endpoints", events, shutdown, |event| {
            self.handle_endpoints_event(&event)
        })
        .await;
    }
}

impl MetadataQuery for MetadataAggregator {
    fn pod_tags(&self, node: &str, namespace: &str, pod: &str) -> Result<Option<Vec<String>>, ControllerError> {
        let bundle = self.pod_bundle.read();
        Ok(bundle
            .nodes
            .get(node)
            .and_then(|pods| pods.get(&ObjectKey::new(namespace, pod)))
            .map(|tags| tags.iter().cloned().collect()))
    }

    fn node_labels(&self, node: &str) -> Result<Option<Vec<String>>, ControllerError> {
        let bundle = self.node_bundle.read();
        Ok(bundle
            .labels
            .get(node)
            .map(|labels| labels.iter().cloned().collect()))
    }

    fn pods_on_node(&self, node: &str) -> Result<NodePods, ControllerError> {
        let labels = self.node_bundle.read();
        let pods = self.pod_bundle.read();
        match pods.pod_tags(node) {
            Some(pods) => Ok(NodePods { pods, warning: None }),
            None => Ok(NodePods {
                pods: PodTags::new(),
                warning: (!node_is_known(node, &labels, &pods))
                    .then(|| format!("no cached metadata found for the node {}", node)),
            }),
        }
    }

    fn all(&self) -> Result<ClusterMetadata, ControllerError> {
        let lister = self
            .node_lister
            .read()
            .clone()
            .ok_or_else(|| ControllerError::Collaborator("node cache is not running".to_string()))?;
        let node_names = lister.list_nodes()?;

        let labels = self.node_bundle.read();
        let pods = self.pod_bundle.read();
        let mut result = ClusterMetadata::default();
        for node in node_names {
            if let Some(tags) = pods.pod_tags(&node) {
                result.nodes.insert(node, tags);
            } else if node_is_known(&node, &labels, &pods) {
                result.nodes.insert(node, PodTags::new());
            } else {
                let err = ControllerError::NotFound(format!("no cached metadata found for the node {}", node));
                result.errors.insert(node, err.to_string());
            }
        }
        Ok(result)
    }
}

fn node_is_known(node: &str, labels: &NodeTagBundle, pods: &PodTagBundle) -> bool {
    labels.labels.contains_key(node) || pods.nodes.contains_key(node)
}

fn service_key(endpoints: &Endpoints) -> Option<ObjectKey> {
    Some(ObjectKey::new(
        endpoints.metadata.namespace.as_deref()?,
        endpoints.metadata.name.as_deref()?,
    ))
}

fn service_tag(service: &str) -> String {
    format!("{}{}", SERVICE_TAG_PREFIX, service)
}

/// Ready pod addresses of a service that carry their node name.
fn backends(endpoints: &Endpoints, namespace: &str) -> HashSet<Backend> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|address| {
            let target = address.target_ref.as_ref()?;
            if target.kind.as_deref() != Some("Pod") {
                return None;
            }
            Some(Backend {
                node: address.node_name.clone()?,
                pod: ObjectKey::new(
                    target.namespace.as_deref().unwrap_or(namespace),
                    target.name.as_deref()?,
                ),
            })
        })
        .collect()
}
