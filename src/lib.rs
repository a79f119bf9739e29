// Nightly clippy (0.1.64) considers Drop a side effect, see https://github.com/rust-lang/rust-clippy/issues/9608
#![allow(clippy::unnecessary_lazy_evaluations)]

pub mod domain;
pub mod error;
pub mod k8s;
pub mod kernel;
pub mod pod;
pub mod reconciler;
pub mod snapshot;
pub mod tuning;

/// Labels and annotations owned by the operator. Every pod managed by the
/// kernel carries the identity labels; the roll label and the hash
/// annotation drive the pod lifecycle decisions.
pub mod labels {
    pub const DOMAIN_UID_LABEL: &str = "weblogic.oracle/domainUID";
    pub const CLUSTER_NAME_LABEL: &str = "weblogic.oracle/clusterName";
    pub const SERVER_NAME_LABEL: &str = "weblogic.oracle/serverName";
    pub const TO_BE_ROLLED_LABEL: &str = "weblogic.oracle/to-be-rolled";
    pub const OPERATOR_VERSION_LABEL: &str = "weblogic.oracle/operator-version";
    pub const POD_HASH_ANNOTATION: &str = "weblogic.oracle/pod-hash";
    /// The introspect version the pod was built against. Outside the
    /// content hash; a moved version rebuilds the admin server through a
    /// fresh introspection instead of patching it in place.
    pub const INTROSPECT_VERSION_ANNOTATION: &str = "weblogic.oracle/introspect-version";
}
