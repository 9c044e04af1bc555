use std::sync::Arc;
use std::time::Duration;

use cabin_api::{Engine, LogOptions, Mutation, NewCluster};
use cabin_core::{CabinError, EntityKey, EntityKind, Event, Policy, SharedPolicy, Topic, REVISION_ANNOTATION};
use cabin_kubehub::fake::{FakeClusterClient, FakeOp};
use futures::StreamExt;
use serde_json::{json, Value};

const C1: &str = "https://c1";
const C2: &str = "https://c2";

fn engine() -> (Engine, Arc<FakeClusterClient>) {
    let fake = Arc::new(FakeClusterClient::new());
    fake.add_cluster(C1);
    fake.add_cluster(C2);
    let engine = Engine::new(fake.clone(), Arc::new(SharedPolicy::new(Policy::default())));
    (engine, fake)
}

fn cluster(name: &str, url: &str) -> NewCluster {
    NewCluster { name: name.into(), url: url.into(), credentials_ref: None }
}

fn pod(name: &str) -> Value {
    json!({"metadata": {"name": name, "namespace": "shop"}, "status": {"phase": "Running"}})
}

fn deployment(name: &str) -> Value {
    json!({
        "metadata": {"name": name, "namespace": "shop"},
        "spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "app", "image": "web:3"}]}}}
    })
}

fn replica_set(name: &str, owner: &str, revision: Option<&str>, image: &str) -> Value {
    let mut annotations = serde_json::Map::new();
    if let Some(r) = revision {
        annotations.insert(REVISION_ANNOTATION.into(), json!(r));
    }
    json!({
        "metadata": {
            "name": name,
            "namespace": "shop",
            "annotations": annotations,
            "ownerReferences": [{"kind": "Deployment", "name": owner}]
        },
        "spec": {"template": {"spec": {"containers": [{"name": "app", "image": image}]}}}
    })
}

#[tokio::test(start_paused = true)]
async fn removing_a_cluster_leaves_no_records_and_no_tasks() {
    let (engine, fake) = engine();
    for n in ["a", "b", "c"] {
        fake.put(C1, EntityKind::Pod, pod(n));
    }
    let c1 = engine.register_cluster(cluster("one", C1)).unwrap();
    let c2 = engine.register_cluster(cluster("two", C2)).unwrap();
    assert_eq!(engine.task_count(), 4);

    // First periodic refresh runs immediately.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.query(c1, EntityKind::Pod, Some("shop")).unwrap().len(), 3);

    let mut events = engine.events(Topic::Global);
    let removed = engine.remove_cluster(c1).unwrap();
    assert_eq!(removed.url, C1);
    assert_eq!(engine.cached_count(c1), 0);
    assert_eq!(engine.task_count(), 2);
    assert!(matches!(engine.query(c1, EntityKind::Pod, None), Err(CabinError::ClusterNotFound(_))));
    assert!(matches!(events.rx.try_recv(), Ok(Event::ClusterRemoved { cluster }) if cluster == c1));

    let probes = fake.count_for(C1, FakeOp::Probe);
    let lists = fake.count_for(C1, FakeOp::List);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fake.count_for(C1, FakeOp::Probe), probes);
    assert_eq!(fake.count_for(C1, FakeOp::List), lists);
    assert!(fake.count_for(C2, FakeOp::Probe) > 1);

    assert!(matches!(engine.remove_cluster(c1), Err(CabinError::ClusterNotFound(_))));
    assert_eq!(engine.clusters().iter().map(|c| c.id).collect::<Vec<_>>(), vec![c2]);
}

#[tokio::test(start_paused = true)]
async fn duplicate_registration_starts_nothing() {
    let (engine, _fake) = engine();
    engine.register_cluster(cluster("one", C1)).unwrap();
    let dup = engine.register_cluster(cluster("again", "https://C1/"));
    assert!(matches!(dup, Err(CabinError::DuplicateCluster(_))));
    assert_eq!(engine.clusters().len(), 1);
    assert_eq!(engine.task_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn check_clusters_reports_each_probe() {
    let (engine, fake) = engine();
    let c1 = engine.register_cluster(cluster("one", C1)).unwrap();
    let c2 = engine.register_cluster(cluster("two", C2)).unwrap();
    fake.set_reachable(C2, false);

    let reports = engine.check_clusters().await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].cluster, c1);
    assert_eq!(reports[0].reachable, Some(true));
    assert_eq!(reports[1].reachable, Some(false));
    assert!(engine.cluster(c1).unwrap().reachable);
    assert!(!engine.cluster(c2).unwrap().reachable);
    assert!(engine.cluster(c2).unwrap().last_checked_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn deployment_history_is_newest_first_and_scoped_to_owner() {
    let (engine, fake) = engine();
    fake.put(C1, EntityKind::Deployment, deployment("web"));
    fake.put(C1, EntityKind::ReplicaSet, replica_set("web-1", "web", Some("1"), "web:1"));
    fake.put(C1, EntityKind::ReplicaSet, replica_set("web-3", "web", Some("3"), "web:3"));
    fake.put(C1, EntityKind::ReplicaSet, replica_set("web-2", "web", Some("2"), "web:2"));
    fake.put(C1, EntityKind::ReplicaSet, replica_set("web-x", "web", None, "web:x"));
    fake.put(C1, EntityKind::ReplicaSet, replica_set("api-1", "api", Some("9"), "api:1"));
    let c1 = engine.register_cluster(cluster("one", C1)).unwrap();
    engine.refresh(c1, EntityKind::Deployment, Some("shop")).await.unwrap();
    engine.refresh(c1, EntityKind::ReplicaSet, Some("shop")).await.unwrap();

    let key = EntityKey::new(c1, EntityKind::Deployment, Some("shop"), "web");
    let history = engine.deployment_history(&key).unwrap();
    assert_eq!(history.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![3, 2, 1]);
    assert_eq!(history[0].images(), vec!["web:3".to_string()]);

    let pod = EntityKey::new(c1, EntityKind::Pod, Some("shop"), "a");
    assert!(matches!(engine.deployment_history(&pod), Err(CabinError::InvalidArgument(_))));
    let missing = EntityKey::new(c1, EntityKind::Deployment, Some("shop"), "nope");
    assert!(matches!(engine.deployment_history(&missing), Err(CabinError::EntityNotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn settings_apply_to_later_mutations() {
    let (engine, fake) = engine();
    fake.put(C1, EntityKind::Deployment, deployment("web"));
    let c1 = engine.register_cluster(cluster("one", C1)).unwrap();
    engine.refresh(c1, EntityKind::Deployment, None).await.unwrap();
    let key = EntityKey::new(c1, EntityKind::Deployment, Some("shop"), "web");

    engine.update_max_replicas(4).unwrap();
    let err = engine.submit(key.clone(), Mutation::Scale { replicas: 5 }).await.unwrap_err();
    assert!(matches!(err, CabinError::InvalidReplicas { requested: 5, max: 4 }));
    assert_eq!(fake.count(FakeOp::Patch), 0);

    assert!(engine.update_max_replicas(0).is_err());
    assert_eq!(engine.policy().max_replicas, 4);

    let out = engine.submit(key.clone(), Mutation::Scale { replicas: 4 }).await.unwrap();
    assert_eq!(out.confirmed.payload.spec_replicas(), Some(4));
    assert_eq!(engine.entity(&key).unwrap().payload.spec_replicas(), Some(4));
    assert!(engine.pending(&key).is_empty());
}

#[tokio::test(start_paused = true)]
async fn refresh_kinds_drive_the_periodic_loop() {
    let (engine, fake) = engine();
    fake.put(C1, EntityKind::Service, json!({"metadata": {"name": "svc", "namespace": "shop"}}));
    engine.update_refresh_kinds(vec![EntityKind::Service]).unwrap();
    assert!(engine.update_refresh_kinds(Vec::new()).is_err());
    let c1 = engine.register_cluster(cluster("one", C1)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.query(c1, EntityKind::Service, None).unwrap().len(), 1);
    assert!(fake.calls().iter().filter(|c| c.op == FakeOp::List).all(|c| c.target.contains("Service")));
}

#[tokio::test(start_paused = true)]
async fn requested_refresh_lands_in_the_cache() {
    let (engine, fake) = engine();
    let c1 = engine.register_cluster(cluster("one", C1)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    fake.put(C1, EntityKind::Pod, pod("late"));

    let mut changes = engine.events(Topic::Kind(c1, EntityKind::Pod));
    engine.request_refresh(c1, EntityKind::Pod, Some("shop")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let key = EntityKey::new(c1, EntityKind::Pod, Some("shop"), "late");
    assert!(engine.entity(&key).is_some());
    assert!(matches!(changes.rx.try_recv(), Ok(Event::EntityChanged { key: k }) if k == key));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_loops_but_keeps_state() {
    let (engine, fake) = engine();
    fake.put(C1, EntityKind::Pod, pod("a"));
    let c1 = engine.register_cluster(cluster("one", C1)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.shutdown();
    assert_eq!(engine.task_count(), 0);
    let probes = fake.count(FakeOp::Probe);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fake.count(FakeOp::Probe), probes);
    assert_eq!(engine.query(c1, EntityKind::Pod, None).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn pod_logs_check_the_cached_container_list() {
    let (engine, fake) = engine();
    fake.put(
        C1,
        EntityKind::Pod,
        json!({
            "metadata": {"name": "web-0", "namespace": "shop"},
            "spec": {"containers": [{"name": "app"}, {"name": "proxy"}]}
        }),
    );
    fake.set_logs(C1, "shop", "web-0", Some("app"), &["booting", "listening on :8080"]);
    let c1 = engine.register_cluster(cluster("one", C1)).unwrap();
    engine.refresh(c1, EntityKind::Pod, Some("shop")).await.unwrap();
    let key = EntityKey::new(c1, EntityKind::Pod, Some("shop"), "web-0");

    let lines: Vec<_> = engine.logs(&key, Some("app"), &LogOptions::default()).await.unwrap().collect().await;
    assert_eq!(lines, vec![Ok("booting".to_string()), Ok("listening on :8080".to_string())]);

    let before = fake.count(FakeOp::Logs);
    assert!(matches!(engine.logs(&key, None, &LogOptions::default()).await, Err(CabinError::InvalidArgument(_))));
    assert!(matches!(engine.logs(&key, Some("db"), &LogOptions::default()).await, Err(CabinError::InvalidArgument(_))));
    let deploy = EntityKey::new(c1, EntityKind::Deployment, Some("shop"), "web");
    assert!(matches!(engine.logs(&deploy, None, &LogOptions::default()).await, Err(CabinError::InvalidArgument(_))));
    assert_eq!(fake.count(FakeOp::Logs), before);

    let ghost = EntityKey::new(c1, EntityKind::Pod, Some("shop"), "ghost");
    let gone: Vec<_> = engine.logs(&ghost, None, &LogOptions::default()).await.unwrap().collect().await;
    assert!(matches!(gone.as_slice(), [Err(cabin_core::ClientError::NotFound(_))]));

    fake.set_reachable(C1, false);
    let down = engine.logs(&key, Some("app"), &LogOptions::default()).await;
    assert!(matches!(down, Err(CabinError::Remote(_))));
}
