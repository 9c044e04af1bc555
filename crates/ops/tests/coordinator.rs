use std::sync::{Arc, Mutex};
use std::time::Duration;

use cabin_core::{
    CabinError, ClientError, ClusterId, EntityKey, EntityKind, Event, MutationStatus, NewCluster, Policy, Topic,
    LAST_APPLIED_ANNOTATION,
};
use cabin_kubehub::fake::{FakeClusterClient, FakeOp};
use cabin_ops::{Coordinator, Mutation};
use cabin_store::{refresh_collection, Bus, EntityCache, Registry};
use serde_json::{json, Value};

const C1: &str = "https://c1";
const C2: &str = "https://c2";

struct Rig {
    bus: Bus,
    registry: Arc<Registry>,
    cache: Arc<EntityCache>,
    fake: Arc<FakeClusterClient>,
    coord: Arc<Coordinator>,
    c1: ClusterId,
    c2: ClusterId,
}

fn deployment(name: &str, replicas: u32, containers: usize) -> Value {
    let containers: Vec<Value> =
        (0..containers).map(|i| json!({"name": format!("c{}", i), "image": format!("img{}:1", i)})).collect();
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": "shop", "labels": {"app": name}},
        "spec": {"replicas": replicas, "template": {"spec": {"containers": containers}}},
        "status": {"replicas": replicas, "availableReplicas": replicas}
    })
}

async fn rig() -> Rig {
    let bus = Bus::new();
    let registry = Arc::new(Registry::new(bus.clone()));
    let cache = Arc::new(EntityCache::new(bus.clone()));
    let fake = Arc::new(FakeClusterClient::new());
    let mut ids = Vec::new();
    for url in [C1, C2] {
        fake.add_cluster(url);
        let id = registry.register(NewCluster { name: url.into(), url: url.into(), credentials_ref: None }).unwrap();
        cache.attach(id);
        ids.push(id);
    }
    let coord = Arc::new(Coordinator::new(
        registry.clone(),
        cache.clone(),
        fake.clone(),
        Arc::new(Policy::default()),
        bus.clone(),
    ));
    Rig { bus, registry, cache, fake, coord, c1: ids[0], c2: ids[1] }
}

impl Rig {
    async fn seed(&self, doc: Value) -> EntityKey {
        let name = doc["metadata"]["name"].as_str().unwrap().to_string();
        self.fake.put(C1, EntityKind::Deployment, doc);
        refresh_collection(&*self.fake, &self.registry, &self.cache, self.c1, EntityKind::Deployment, None, 100)
            .await
            .unwrap();
        EntityKey::new(self.c1, EntityKind::Deployment, Some("shop"), &name)
    }

    fn labels(&self, key: &EntityKey) -> Vec<(String, String)> {
        self.cache.get(key).unwrap().payload.labels().into_vec()
    }
}

#[tokio::test]
async fn invalid_label_is_rejected_before_any_network_call() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let before = r.fake.calls().len();
    let err = r
        .coord
        .submit(key.clone(), Mutation::LabelAdd { key: "env".into(), value: "prod ".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CabinError::InvalidLabelFormat(_)));
    assert!(err.is_validation());
    assert_eq!(r.fake.calls().len(), before);
    assert!(r.coord.pending(&key).is_empty());
}

#[tokio::test]
async fn label_add_and_delete_commit_server_versions() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let rv0 = r.cache.get(&key).unwrap().resource_version;
    let out = r.coord.submit(key.clone(), Mutation::LabelAdd { key: "env".into(), value: "prod".into() }).await.unwrap();
    assert!(out.cached);
    assert!(out.confirmed.resource_version > rv0);
    assert_eq!(r.cache.get(&key).unwrap().payload.label("env"), Some("prod"));

    r.coord.submit(key.clone(), Mutation::LabelDelete { key: "env".into() }).await.unwrap();
    assert_eq!(r.cache.get(&key).unwrap().payload.label("env"), None);
    assert_eq!(r.fake.object(C1, EntityKind::Deployment, Some("shop"), "web").unwrap()["metadata"]["labels"], json!({"app": "web"}));
}

#[tokio::test]
async fn rolling_update_with_two_containers_never_reaches_the_server() {
    let r = rig().await;
    let key = r.seed(deployment("multi", 1, 2)).await;
    let before = r.fake.calls().len();
    let err = r.coord.submit(key.clone(), Mutation::RollingUpdate { image: "img:2".into() }).await.unwrap_err();
    assert_eq!(err, CabinError::UnsupportedMultiContainer(2));
    assert_eq!(r.fake.calls().len(), before);
}

#[tokio::test(start_paused = true)]
async fn rolling_update_leaves_cache_alone_until_confirmed() {
    let r = rig().await;
    let key = r.seed(deployment("web", 1, 1)).await;
    let before = r.cache.get(&key).unwrap();
    r.fake.set_patch_delay(Some(Duration::from_millis(500)));
    let coord = r.coord.clone();
    let k = key.clone();
    let task = tokio::spawn(async move { coord.submit(k, Mutation::RollingUpdate { image: "img0:2".into() }).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(Arc::ptr_eq(&r.cache.get(&key).unwrap(), &before));
    assert_eq!(r.coord.pending(&key).len(), 1);
    assert!(r.coord.pending(&key)[0].optimistic_payload.is_none());
    task.await.unwrap().unwrap();
    let after = r.cache.get(&key).unwrap();
    assert_eq!(after.payload.template_containers()[0]["image"], json!("img0:2"));
    assert_eq!(after.payload.template_containers()[0]["name"], json!("c0"));
}

#[tokio::test(start_paused = true)]
async fn scale_is_previewed_then_status_arrives_with_the_follow_up() {
    let r = rig().await;
    let key = r.seed(deployment("d1", 2, 1)).await;
    r.fake.set_patch_delay(Some(Duration::from_millis(300)));
    let coord = r.coord.clone();
    let k = key.clone();
    let task = tokio::spawn(async move { coord.submit(k, Mutation::Scale { replicas: 5 }).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(r.cache.get(&key).unwrap().payload.spec_replicas(), Some(5));
    assert_eq!(r.coord.pending(&key)[0].optimistic_payload.as_ref().and_then(|d| d.spec_replicas()), Some(5));

    let out = task.await.unwrap().unwrap();
    assert_eq!(out.confirmed.payload.spec_replicas(), Some(5));
    assert_eq!(r.cache.get(&key).unwrap().payload.status_replicas(), Some(2));
    let gets = r.fake.count(FakeOp::Get);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(r.fake.count(FakeOp::Get), gets + 1);
    let cur = r.cache.get(&key).unwrap();
    assert_eq!(cur.payload.status_replicas(), Some(5));
    assert_eq!(cur.payload.status_available_replicas(), Some(5));
}

#[tokio::test]
async fn replicas_above_policy_maximum_are_rejected() {
    let r = rig().await;
    let key = r.seed(deployment("d1", 2, 1)).await;
    let err = r.coord.submit(key, Mutation::Scale { replicas: 21 }).await.unwrap_err();
    assert_eq!(err, CabinError::InvalidReplicas { requested: 21, max: 20 });
    assert_eq!(r.fake.count(FakeOp::Patch), 0);
}

#[tokio::test]
async fn failed_patch_restores_the_exact_previous_record() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let before = serde_json::to_string(&*r.cache.get(&key).unwrap()).unwrap();
    r.fake.fail_next(C1, FakeOp::Patch, ClientError::Server("boom".into()));
    let err = r.coord.submit(key.clone(), Mutation::Scale { replicas: 4 }).await.unwrap_err();
    assert!(matches!(err, CabinError::MutationFailed { .. }));
    assert_eq!(serde_json::to_string(&*r.cache.get(&key).unwrap()).unwrap(), before);
}

#[tokio::test]
async fn conflict_forces_a_fresh_read_before_failing() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    // Someone else changed the object behind our back.
    let mut remote = r.fake.object(C1, EntityKind::Deployment, Some("shop"), "web").unwrap();
    remote["metadata"]["labels"]["owner"] = json!("ops");
    r.fake.put(C1, EntityKind::Deployment, remote);
    r.fake.fail_next(C1, FakeOp::Patch, ClientError::Conflict("stale resourceVersion".into()));

    let err = r.coord.submit(key.clone(), Mutation::LabelAdd { key: "env".into(), value: "dev".into() }).await.unwrap_err();
    assert!(matches!(err, CabinError::MutationFailed { ref reason } if reason.contains("conflict")));
    assert_eq!(r.fake.count(FakeOp::Get), 1);
    let cur = r.cache.get(&key).unwrap();
    assert_eq!(cur.payload.label("owner"), Some("ops"));
    assert_eq!(cur.payload.label("env"), None);
}

#[tokio::test]
async fn malformed_confirmation_is_not_cached() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let before = r.cache.get(&key).unwrap();
    r.fake.fail_next(C1, FakeOp::Patch, ClientError::Malformed("truncated body".into()));
    let err = r.coord.submit(key.clone(), Mutation::Scale { replicas: 3 }).await.unwrap_err();
    assert!(matches!(err, CabinError::MalformedResponse(_)));
    assert!(Arc::ptr_eq(&r.cache.get(&key).unwrap(), &before));
}

#[tokio::test(start_paused = true)]
async fn timeout_rolls_back_and_reports() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let before = r.cache.get(&key).unwrap();
    r.fake.set_patch_delay(Some(Duration::from_secs(60)));
    let err = r.coord.submit(key.clone(), Mutation::Scale { replicas: 9 }).await.unwrap_err();
    assert_eq!(err, CabinError::MutationTimedOut(Duration::from_secs(15)));
    assert!(Arc::ptr_eq(&r.cache.get(&key).unwrap(), &before));
    assert!(r.coord.pending(&key).is_empty());
}

fn resolutions(events: &mut cabin_bus::EventStream) -> Vec<(MutationStatus, Option<String>)> {
    let mut out = Vec::new();
    while let Ok(ev) = events.rx.try_recv() {
        if let Event::MutationResolved { status, reason, .. } = ev {
            out.push((status, reason));
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn abandoned_submit_still_commits_and_reports() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let mut events = r.bus.stream(Topic::Global);
    r.fake.set_patch_delay(Some(Duration::from_secs(5)));

    let waited = tokio::time::timeout(Duration::from_secs(1), r.coord.submit(key.clone(), Mutation::Scale { replicas: 9 })).await;
    assert!(waited.is_err());
    assert_eq!(r.cache.get(&key).unwrap().payload.spec_replicas(), Some(9));
    assert_eq!(r.coord.pending(&key).len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(r.coord.pending(&key).is_empty());
    assert_eq!(resolutions(&mut events), vec![(MutationStatus::Confirmed, None)]);
    let server = r.fake.object(C1, EntityKind::Deployment, Some("shop"), "web").unwrap();
    let cached = r.cache.get(&key).unwrap();
    assert_eq!(server["spec"]["replicas"], json!(9));
    assert_eq!(cached.payload.spec_replicas(), Some(9));
    assert_eq!(cached.resource_version.to_string(), server["metadata"]["resourceVersion"].as_str().unwrap());
}

#[tokio::test(start_paused = true)]
async fn abandoned_submit_that_times_out_still_rolls_back() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let before = r.cache.get(&key).unwrap();
    let mut events = r.bus.stream(Topic::Global);
    r.fake.set_patch_delay(Some(Duration::from_secs(60)));

    let waited = tokio::time::timeout(Duration::from_secs(1), r.coord.submit(key.clone(), Mutation::Scale { replicas: 9 })).await;
    assert!(waited.is_err());
    assert_eq!(r.cache.get(&key).unwrap().payload.spec_replicas(), Some(9));

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(Arc::ptr_eq(&r.cache.get(&key).unwrap(), &before));
    assert!(r.coord.pending(&key).is_empty());
    let resolved = resolutions(&mut events);
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].0, MutationStatus::Failed);
    assert_eq!(r.fake.object(C1, EntityKind::Deployment, Some("shop"), "web").unwrap()["spec"]["replicas"], json!(2));
}

#[tokio::test(start_paused = true)]
async fn abandoning_a_queued_submit_keeps_its_place() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let mut events = r.bus.stream(Topic::Global);
    r.fake.set_patch_delay(Some(Duration::from_millis(400)));

    let coord = r.coord.clone();
    let k = key.clone();
    let first = tokio::spawn(async move { coord.submit(k, Mutation::LabelAdd { key: "a".into(), value: "1".into() }).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let waited =
        tokio::time::timeout(Duration::from_millis(50), r.coord.submit(key.clone(), Mutation::Scale { replicas: 4 })).await;
    assert!(waited.is_err());
    let pending = r.coord.pending(&key);
    assert_eq!(pending.len(), 2);
    assert!(pending[0].in_flight && !pending[1].in_flight);

    first.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(r.coord.busy_keys(), 0);
    assert_eq!(resolutions(&mut events), vec![(MutationStatus::Confirmed, None), (MutationStatus::Confirmed, None)]);
    let cached = r.cache.get(&key).unwrap();
    assert_eq!(cached.payload.label("a"), Some("1"));
    assert_eq!(cached.payload.spec_replicas(), Some(4));
}

#[tokio::test(start_paused = true)]
async fn mutations_on_one_key_run_in_order_without_interleaving() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    r.fake.set_patch_delay(Some(Duration::from_millis(400)));

    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let cache = Arc::clone(&r.cache);
    let watched = key.clone();
    let _h = r.bus.subscribe(Topic::Kind(r.c1, EntityKind::Deployment), move |ev| {
        if let Event::EntityChanged { key } = ev {
            if *key == watched {
                let mut labels = cache.get(key).map(|rec| rec.payload.labels().into_vec()).unwrap_or_default();
                labels.sort();
                sink.lock().unwrap().push(labels);
            }
        }
    });

    let (c1, c2) = (r.coord.clone(), r.coord.clone());
    let (k1, k2) = (key.clone(), key.clone());
    let first = tokio::spawn(async move { c1.submit(k1, Mutation::LabelAdd { key: "a".into(), value: "1".into() }).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = tokio::spawn(async move { c2.submit(k2, Mutation::LabelAdd { key: "b".into(), value: "2".into() }).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pending = r.coord.pending(&key);
    assert_eq!(pending.len(), 2);
    assert!(pending[0].in_flight && !pending[1].in_flight);
    assert_eq!(r.labels(&key).iter().filter(|(k, _)| k == "b").count(), 0);

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    let lab = |pairs: &[(&str, &str)]| -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    };
    let seen = snapshots.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            lab(&[("a", "1"), ("app", "web")]),
            lab(&[("a", "1"), ("app", "web")]),
            lab(&[("a", "1"), ("app", "web"), ("b", "2")]),
            lab(&[("a", "1"), ("app", "web"), ("b", "2")]),
        ]
    );
    assert_eq!(r.coord.busy_keys(), 0);
}

#[tokio::test(start_paused = true)]
async fn second_mutation_previews_against_rolled_back_state() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    r.fake.set_patch_delay(Some(Duration::from_millis(200)));
    r.fake.fail_next(C1, FakeOp::Patch, ClientError::Network("reset".into()));
    let (c1, c2) = (r.coord.clone(), r.coord.clone());
    let (k1, k2) = (key.clone(), key.clone());
    let first = tokio::spawn(async move { c1.submit(k1, Mutation::Scale { replicas: 7 }).await });
    tokio::time::sleep(Duration::from_millis(1)).await;
    let second = tokio::spawn(async move { c2.submit(k2, Mutation::LabelAdd { key: "b".into(), value: "2".into() }).await });
    assert!(first.await.unwrap().is_err());
    let out = second.await.unwrap().unwrap();
    assert_eq!(out.confirmed.payload.spec_replicas(), Some(2));
    assert_eq!(r.cache.get(&key).unwrap().payload.spec_replicas(), Some(2));
    assert_eq!(r.cache.get(&key).unwrap().payload.label("b"), Some("2"));
}

#[tokio::test]
async fn copy_without_stored_configuration_fails_locally() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let err = r.coord.submit(key, Mutation::CrossClusterCopy { target: r.c2 }).await.unwrap_err();
    assert!(matches!(err, CabinError::MissingSourceConfiguration(_)));
    assert_eq!(r.fake.count(FakeOp::Create), 0);
}

#[tokio::test]
async fn copy_creates_on_target_and_caches_destination_only() {
    let r = rig().await;
    let mut doc = deployment("web", 2, 1);
    let applied = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "shop", "labels": {"app": "web"}},
        "spec": {"replicas": 2, "template": {"spec": {"containers": [{"name": "c0", "image": "img0:1"}]}}}
    });
    doc["metadata"]["annotations"] = json!({LAST_APPLIED_ANNOTATION: applied.to_string()});
    let key = r.seed(doc).await;
    let source_before = r.cache.get(&key).unwrap();
    let mut events = r.bus.stream(Topic::Global);

    let out = r.coord.submit(key.clone(), Mutation::CrossClusterCopy { target: r.c2 }).await.unwrap();
    assert_eq!(out.key, EntityKey::new(r.c2, EntityKind::Deployment, Some("shop"), "web"));
    assert!(r.cache.get(&out.key).is_some());
    assert!(Arc::ptr_eq(&r.cache.get(&key).unwrap(), &source_before));
    let created = r.fake.object(C2, EntityKind::Deployment, Some("shop"), "web").unwrap();
    assert!(created["metadata"]["uid"].is_string());
    assert!(created.get("status").is_none());

    let mut resolved = None;
    while let Ok(ev) = events.rx.try_recv() {
        if let Event::MutationResolved { status, key: k, .. } = ev {
            resolved = Some((status, k));
        }
    }
    assert_eq!(resolved, Some((MutationStatus::Confirmed, key.clone())));

    let again = r.coord.submit(key, Mutation::CrossClusterCopy { target: r.c2 }).await.unwrap_err();
    assert!(matches!(again, CabinError::MutationFailed { .. }));
}

#[tokio::test]
async fn copy_to_the_source_cluster_or_an_unknown_one_is_refused() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    let same = r.coord.submit(key.clone(), Mutation::CrossClusterCopy { target: r.c1 }).await.unwrap_err();
    assert!(same.is_validation());
    let ghost = ClusterId::new();
    let mut doc = r.cache.get(&key).unwrap().payload.to_value();
    doc["metadata"]["annotations"] = json!({LAST_APPLIED_ANNOTATION: "{}"});
    r.fake.put(C1, EntityKind::Deployment, doc);
    refresh_collection(&*r.fake, &r.registry, &r.cache, r.c1, EntityKind::Deployment, None, 100).await.unwrap();
    let err = r.coord.submit(key, Mutation::CrossClusterCopy { target: ghost }).await.unwrap_err();
    assert_eq!(err, CabinError::ClusterNotFound(ghost));
}

#[tokio::test(start_paused = true)]
async fn confirmation_after_cluster_removal_is_dropped() {
    let r = rig().await;
    let key = r.seed(deployment("web", 2, 1)).await;
    r.fake.set_patch_delay(Some(Duration::from_millis(500)));
    let coord = r.coord.clone();
    let k = key.clone();
    let task = tokio::spawn(async move { coord.submit(k, Mutation::Scale { replicas: 3 }).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    r.registry.remove(r.c1).unwrap();
    r.cache.purge_cluster(r.c1);
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err, CabinError::ClusterRemoved(r.c1));
    assert_eq!(r.cache.count(r.c1), 0);
    assert!(!r.cache.has_cluster(r.c1));
}
