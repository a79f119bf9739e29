mod common;

use std::time::Duration;

use common::{harness, snapshot, FakeKubernetes};
use weblogic_operator::pod::is_ready;

/// A fresh domain with one two-replica cluster materializes as one admin
/// pod plus two managed pods, all Ready before the fiber completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_from_empty_starts_admin_and_cluster() {
    let fake = FakeKubernetes::new();
    let reconciler = harness(&fake);

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        reconciler.submit(snapshot("store/weblogic:v1", 1, &[("c1", 2, 1, 2)])),
    )
    .await
    .expect("reconciliation finished in time")
    .expect("fiber reported an outcome");
    assert!(outcome.is_ok(), "reconciliation failed: {outcome:?}");

    assert_eq!(
        fake.pod_names(),
        vec![
            "uid1-admin-server".to_string(),
            "uid1-c1-managed-server1".to_string(),
            "uid1-c1-managed-server2".to_string(),
        ]
    );
    assert_eq!(fake.creates.lock().unwrap().len(), 3);
    assert!(fake.deletes.lock().unwrap().is_empty());
    for name in fake.pod_names() {
        assert!(
            is_ready(&fake.pod(&name).unwrap()),
            "pod {name} should be ready at completion"
        );
    }

    // The gate entry is cleared once the fiber completes.
    assert!(reconciler.status_snapshot().is_empty());
}
