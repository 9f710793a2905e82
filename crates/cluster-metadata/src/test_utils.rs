//! Test utilities for unit testing controllers and the metadata cache
//!
//! This module provides builders for Kubernetes objects and an in-memory
//! watch source fed through channels.

use crate::informer::{EventStream, WatchSource, WatchedResource};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{stream, StreamExt};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, ExternalMetricSource, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerSpec, MetricIdentifier, MetricSpec, MetricTarget,
};
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, Node, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::watcher;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};

type EventSender<K> = UnboundedSender<Result<watcher::Event<K>, watcher::Error>>;
type EventReceiver<K> = UnboundedReceiver<Result<watcher::Event<K>, watcher::Error>>;

/// Watch source backed by channels, one per resource kind.
///
/// Kinds without a registered channel get a stream that never yields.
#[derive(Default)]
pub struct ChannelSource {
    receivers: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
}

impl ChannelSource {
    /// Registers a channel for `K` and returns its sending half.
    pub fn channel<K: WatchedResource>(&self) -> EventSender<K> {
        let (tx, rx) = mpsc::unbounded::<Result<watcher::Event<K>, watcher::Error>>();
        self.receivers.lock().insert(TypeId::of::<K>(), Box::new(rx));
        tx
    }
}

impl WatchSource for ChannelSource {
    fn watch<K: WatchedResource>(&self) -> EventStream<K> {
        let receiver = self
            .receivers
            .lock()
            .remove(&TypeId::of::<K>())
            .and_then(|rx| rx.downcast::<EventReceiver<K>>().ok());
        match receiver {
            Some(rx) => rx.boxed(),
            None => stream::pending().boxed(),
        }
    }
}

/// Helper to create a test Node with labels
pub fn node(name: &str, labels: BTreeMap<String, String>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to build a label map from pairs
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Helper to create test Endpoints for a service.
///
/// `backends` are `(node, pod)` pairs, all in the service namespace.
pub fn endpoints(namespace: &str, service: &str, backends: &[(&str, &str)]) -> Endpoints {
    let addresses = backends
        .iter()
        .enumerate()
        .map(|(i, (node, pod))| EndpointAddress {
            ip: format!("10.0.0.{}", i + 1),
            node_name: Some(node.to_string()),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Endpoints {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(addresses),
            ..Default::default()
        }]),
    }
}

/// Helper to create a test HorizontalPodAutoscaler using external metrics
pub fn hpa(namespace: &str, name: &str, external_metrics: &[&str]) -> HorizontalPodAutoscaler {
    let metrics = external_metrics
        .iter()
        .map(|metric| MetricSpec {
            type_: "External".to_string(),
            external: Some(ExternalMetricSource {
                metric: MetricIdentifier {
                    name: metric.to_string(),
                    selector: None,
                },
                target: MetricTarget {
                    type_: "Value".to_string(),
                    ..Default::default()
                },
            }),
            ..Default::default()
        })
        .collect();

    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            max_replicas: 5,
            metrics: Some(metrics),
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: name.to_string(),
            },
            ..Default::default()
        }),
        status: None,
    }
}
