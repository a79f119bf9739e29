mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{harness_with_introspector, snapshot, CountingIntrospector, FakeKubernetes};
use weblogic_operator::labels::INTROSPECT_VERSION_ANNOTATION;
use weblogic_operator::snapshot::DomainSnapshot;

const ADMIN_POD: &str = "uid1-admin-server";

fn versioned(mut snapshot: DomainSnapshot, version: &str) -> DomainSnapshot {
    snapshot.introspect_version = Some(version.to_string());
    snapshot
}

/// Bumping the introspect version alone re-runs introspection and rebuilds
/// the admin server pod; nothing else is touched. The first pass through
/// the admin step detects the stale version stamp, defers to a forced
/// introspection, and only then cycles the pod.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn introspect_version_bump_reruns_introspection_and_rebuilds_admin() {
    let fake = FakeKubernetes::new();
    let introspector = Arc::new(CountingIntrospector::default());
    let reconciler = harness_with_introspector(&fake, introspector.clone());

    let seeded = tokio::time::timeout(
        Duration::from_secs(30),
        reconciler.submit(versioned(snapshot("store/weblogic:v1", 1, &[("c1", 2, 1, 2)]), "1")),
    )
    .await
    .expect("seeding finished")
    .expect("seeding reported an outcome");
    assert!(seeded.is_ok(), "seeding failed: {seeded:?}");
    assert_eq!(introspector.runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        pod_introspect_version(&fake, ADMIN_POD).as_deref(),
        Some("1")
    );
    fake.clear_recorders();

    let rebuilt = tokio::time::timeout(
        Duration::from_secs(30),
        reconciler.submit(versioned(snapshot("store/weblogic:v1", 2, &[("c1", 2, 1, 2)]), "2")),
    )
    .await
    .expect("rebuild pass finished")
    .expect("rebuild pass reported an outcome");
    assert!(rebuilt.is_ok(), "rebuild pass failed: {rebuilt:?}");

    // The introspector ran once more before the admin pod was replaced.
    assert_eq!(introspector.runs.load(Ordering::SeqCst), 2);

    // Only the admin pod cycles; the managed servers' hashes are
    // unchanged and their stamps are not patched into currency.
    assert_eq!(fake.deletes.lock().unwrap().clone(), vec![ADMIN_POD.to_string()]);
    assert_eq!(
        pod_introspect_version(&fake, ADMIN_POD).as_deref(),
        Some("2")
    );
    assert_eq!(
        pod_introspect_version(&fake, "uid1-c1-managed-server1").as_deref(),
        Some("1")
    );
    assert!(fake
        .patches
        .lock()
        .unwrap()
        .iter()
        .all(|(pod, _)| pod != "uid1-c1-managed-server1" && pod != "uid1-c1-managed-server2"));
}

/// Resubmitting at an unchanged introspect version reuses the cached
/// topology: no new introspector run, no pod churn.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_introspect_version_reuses_cached_topology() {
    let fake = FakeKubernetes::new();
    let introspector = Arc::new(CountingIntrospector::default());
    let reconciler = harness_with_introspector(&fake, introspector.clone());

    let seeded = tokio::time::timeout(
        Duration::from_secs(30),
        reconciler.submit(versioned(snapshot("store/weblogic:v1", 1, &[]), "1")),
    )
    .await
    .expect("seeding finished")
    .expect("seeding reported an outcome");
    assert!(seeded.is_ok(), "seeding failed: {seeded:?}");
    fake.clear_recorders();

    let repeat = tokio::time::timeout(
        Duration::from_secs(30),
        reconciler.submit(versioned(snapshot("store/weblogic:v1", 2, &[]), "1")),
    )
    .await
    .expect("repeat pass finished")
    .expect("repeat pass reported an outcome");
    assert!(repeat.is_ok(), "repeat pass failed: {repeat:?}");

    assert_eq!(introspector.runs.load(Ordering::SeqCst), 1);
    assert!(fake.deletes.lock().unwrap().is_empty());
    assert!(fake.creates.lock().unwrap().is_empty());
}

fn pod_introspect_version(fake: &FakeKubernetes, name: &str) -> Option<String> {
    fake.pod(name)?
        .metadata
        .annotations?
        .get(INTROSPECT_VERSION_ANNOTATION)
        .cloned()
}
