mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{harness, snapshot, FakeKubernetes, DOMAIN_UID};
use json_patch::PatchOperation;
use weblogic_operator::snapshot::DomainSnapshot;

const ADMIN_POD: &str = "uid1-admin-server";

fn annotated(mut snapshot: DomainSnapshot) -> DomainSnapshot {
    snapshot
        .admin_server
        .annotations
        .insert("foo".to_string(), "bar".to_string());
    snapshot
}

async fn seeded_admin_domain(fake: &std::sync::Arc<FakeKubernetes>) -> std::sync::Arc<weblogic_operator::reconciler::DomainReconciler> {
    let reconciler = harness(fake);
    let seeded = tokio::time::timeout(
        Duration::from_secs(30),
        reconciler.submit(snapshot("store/weblogic:v1", 1, &[])),
    )
    .await
    .expect("seeding finished")
    .expect("seeding reported an outcome");
    assert!(seeded.is_ok(), "seeding failed: {seeded:?}");
    fake.clear_recorders();
    reconciler
}

/// A snapshot change confined to a non-hashed annotation patches exactly
/// that path; nothing is deleted and the content hash stays put.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn annotation_only_change_patches_in_place() {
    let fake = FakeKubernetes::new();
    let reconciler = seeded_admin_domain(&fake).await;
    let hash_before = pod_hash_annotation(&fake);

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        reconciler.submit(annotated(snapshot("store/weblogic:v1", 2, &[]))),
    )
    .await
    .expect("patch pass finished")
    .expect("patch pass reported an outcome");
    assert!(outcome.is_ok(), "patch pass failed: {outcome:?}");

    assert!(fake.deletes.lock().unwrap().is_empty());
    assert!(fake.creates.lock().unwrap().is_empty());

    let patches = fake.patches.lock().unwrap();
    assert_eq!(patches.len(), 1, "expected exactly one patch");
    let (pod, patch) = &patches[0];
    assert_eq!(pod, ADMIN_POD);
    assert_eq!(patch.0.len(), 1, "expected a single operation");
    match &patch.0[0] {
        PatchOperation::Add(op) => assert_eq!(op.path, "/metadata/annotations/foo"),
        other => panic!("expected an add on /metadata/annotations/foo, got {other:?}"),
    }
    drop(patches);

    assert_eq!(pod_hash_annotation(&fake), hash_before);
    assert_eq!(
        annotations(&fake).get("foo").map(String::as_str),
        Some("bar")
    );
}

/// A 409 on the first PATCH attempt re-enters from READ and succeeds on
/// the retry without creating anything.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_patch_rereads_and_retries() {
    let fake = FakeKubernetes::new();
    let reconciler = seeded_admin_domain(&fake).await;
    fake.fail_next_patch.store(true, Ordering::SeqCst);

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        reconciler.submit(annotated(snapshot("store/weblogic:v1", 2, &[]))),
    )
    .await
    .expect("patch pass finished")
    .expect("patch pass reported an outcome");
    assert!(outcome.is_ok(), "patch pass failed: {outcome:?}");

    let patches = fake.patches.lock().unwrap();
    assert_eq!(patches.len(), 2, "one conflicted attempt, one successful");
    drop(patches);
    assert!(fake.creates.lock().unwrap().is_empty(), "no duplicate creation");
    assert_eq!(
        annotations(&fake).get("foo").map(String::as_str),
        Some("bar")
    );
}

fn annotations(fake: &FakeKubernetes) -> BTreeMap<String, String> {
    fake.pod(ADMIN_POD)
        .unwrap()
        .metadata
        .annotations
        .unwrap_or_default()
}

fn pod_hash_annotation(fake: &FakeKubernetes) -> String {
    annotations(fake)
        .get("weblogic.oracle/pod-hash")
        .cloned()
        .unwrap_or_else(|| panic!("pod {ADMIN_POD} of {DOMAIN_UID} misses its hash annotation"))
}
