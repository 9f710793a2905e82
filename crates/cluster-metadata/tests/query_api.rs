//! End-to-end: informer events flow through the default catalog into the
//! metadata cache and out of the query API.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use cluster_metadata::api::{router, ApiState};
use cluster_metadata::informer::{EventStream, WatchSource, WatchedResource};
use cluster_metadata::metrics::ApiMetrics;
use cluster_metadata::{
    default_catalog, orchestrator, AgentConfig, ControllerContext, InformerFactory, LeadershipState, MetadataAggregator,
    MetadataQuery,
};
use futures::channel::mpsc::{self, UnboundedSender};
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, Node, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::watcher;
use serde_json::{json, Value};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

type Events<K> = UnboundedSender<Result<watcher::Event<K>, watcher::Error>>;

/// Watch source fed by the test, one channel per kind.
#[derive(Default)]
struct ScriptedSource {
    streams: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
}

impl ScriptedSource {
    fn script<K: WatchedResource>(&self) -> Events<K> {
        let (tx, rx) = mpsc::unbounded::<Result<watcher::Event<K>, watcher::Error>>();
        let stream: EventStream<K> = rx.boxed();
        self.streams.lock().unwrap().insert(TypeId::of::<K>(), Box::new(stream));
        tx
    }
}

impl WatchSource for ScriptedSource {
    fn watch<K: WatchedResource>(&self) -> EventStream<K> {
        let scripted = self.streams.lock().unwrap().remove(&TypeId::of::<K>());
        match scripted.and_then(|boxed| boxed.downcast::<EventStream<K>>().ok()) {
            Some(stream) => *stream,
            None => stream::pending().boxed(),
        }
    }
}

fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn endpoints(namespace: &str, service: &str, backends: &[(&str, &str)]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                backends
                    .iter()
                    .map(|(node, pod)| EndpointAddress {
                        ip: "10.1.0.1".to_string(),
                        node_name: Some(node.to_string()),
                        target_ref: Some(ObjectReference {
                            kind: Some("Pod".to_string()),
                            name: Some(pod.to_string()),
                            namespace: Some(namespace.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

async fn get(state: &ApiState, uri: &str) -> (StatusCode, Value) {
    let response = router(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    (status, value)
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_events_are_served_by_the_api() {
    let source = ScriptedSource::default();
    let nodes = source.script::<Node>();
    let services = source.script::<Endpoints>();

    nodes.unbounded_send(Ok(watcher::Event::Init)).unwrap();
    for n in [node("n1", &[("zone", "a")]), node("n2", &[("zone", "b")])] {
        nodes.unbounded_send(Ok(watcher::Event::InitApply(n))).unwrap();
    }
    nodes.unbounded_send(Ok(watcher::Event::InitDone)).unwrap();

    services.unbounded_send(Ok(watcher::Event::Init)).unwrap();
    services
        .unbounded_send(Ok(watcher::Event::InitApply(endpoints("default", "svc-a", &[("n1", "p1"), ("n2", "p2")]))))
        .unwrap();
    services.unbounded_send(Ok(watcher::Event::InitDone)).unwrap();

    let config = AgentConfig::default();
    let shutdown = CancellationToken::new();
    let aggregator = Arc::new(MetadataAggregator::new());
    let ctx = ControllerContext::new(
        &config,
        Arc::new(InformerFactory::new(source)),
        Arc::clone(&aggregator),
        Arc::new(LeadershipState::new(true)),
        shutdown.clone(),
    );

    let catalog = default_catalog(&config).unwrap();
    let mut startup = orchestrator::run(&catalog, &ctx);
    assert_eq!(startup.started, vec!["metadata"]);
    let outcomes = startup.wait_ready().await;
    assert!(outcomes.iter().all(|(_, result)| result.is_ok()));

    let state = ApiState::new(aggregator, ApiMetrics::new().unwrap());
    eventually(|| state.metadata.pods_on_node("n2").map(|p| !p.pods.is_empty()).unwrap_or(false)).await;

    let (status, body) = get(&state, "/api/v1/tags/pod/n1/default/p1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["kube_service:svc-a"]));

    let (status, body) = get(&state, "/api/v1/tags/node/n2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["zone:b"]));

    let (status, body) = get(&state, "/api/v1/tags/pod").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "nodes": {
                "n1": {"default": {"p1": ["kube_service:svc-a"]}},
                "n2": {"default": {"p2": ["kube_service:svc-a"]}},
            },
            "errors": {},
        })
    );

    // p2 leaves the service: its only tag goes away and so does the pod
    services
        .unbounded_send(Ok(watcher::Event::Apply(endpoints("default", "svc-a", &[("n1", "p1")]))))
        .unwrap();
    eventually(|| matches!(state.metadata.pod_tags("n2", "default", "p2"), Ok(None))).await;

    let (status, body) = get(&state, "/api/v1/tags/pod/n2/default/p2").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        Value::String("Could not find associated metadata mapped to the pod: default/p2 on node: n2".to_string())
    );

    shutdown.cancel();
    startup.join_informers().await;
}

#[tokio::test]
async fn test_partial_cluster_view_is_503() {
    let source = ScriptedSource::default();
    let nodes = source.script::<Node>();
    let services = source.script::<Endpoints>();

    // n2 ends up in the node store but not in the metadata cache
    let config = AgentConfig::default();
    let shutdown = CancellationToken::new();
    let aggregator = Arc::new(MetadataAggregator::new());
    let ctx = ControllerContext::new(
        &config,
        Arc::new(InformerFactory::new(source)),
        Arc::clone(&aggregator),
        Arc::new(LeadershipState::new(true)),
        shutdown.clone(),
    );
    let mut startup = orchestrator::run(&default_catalog(&config).unwrap(), &ctx);

    nodes.unbounded_send(Ok(watcher::Event::Init)).unwrap();
    nodes.unbounded_send(Ok(watcher::Event::InitApply(node("n1", &[("zone", "a")])))).unwrap();
    nodes.unbounded_send(Ok(watcher::Event::InitDone)).unwrap();
    services.unbounded_send(Ok(watcher::Event::Init)).unwrap();
    services.unbounded_send(Ok(watcher::Event::InitDone)).unwrap();
    assert!(startup.wait_ready().await.iter().all(|(_, result)| result.is_ok()));

    let state = ApiState::new(aggregator, ApiMetrics::new().unwrap());
    eventually(|| matches!(state.metadata.node_labels("n1"), Ok(Some(_)))).await;

    // drop n2 from the labels bundle while it stays in the node store
    nodes.unbounded_send(Ok(watcher::Event::Apply(node("n2", &[])))).unwrap();
    eventually(|| matches!(state.metadata.node_labels("n2"), Ok(Some(_)))).await;
    ctx.aggregator.delete_node(&node("n2", &[]));

    let (status, body) = get(&state, "/api/v1/tags/pod").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["nodes"], json!({"n1": {}}));
    assert_eq!(body["errors"]["n2"], json!("Not found: no cached metadata found for the node n2"));
    assert_eq!(
        state.metrics.requests("getAllMetadata", StatusCode::SERVICE_UNAVAILABLE),
        1
    );

    shutdown.cancel();
    startup.join_informers().await;
}
