pub mod client;
pub mod retry;

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use thiserror::Error;

use crate::domain::DomainStatus;

/// Classified outcome of a Kubernetes API request. The kernel never looks
/// at raw HTTP; every call site branches on these kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiFailure {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("write conflict")]
    Conflict,
    #[error("request rejected: {0}")]
    Invalid(String),
    #[error("throttled by the API server")]
    Throttled,
    #[error("API server error (status {0})")]
    Server(u16),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ApiFailure {
    /// True for failures worth retrying with backoff. Conflicts are not
    /// retried blindly; the caller re-reads and recomputes instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiFailure::Throttled | ApiFailure::Server(_) | ApiFailure::Transport(_)
        )
    }
}

/// The thin surface the kernel consumes from the Kubernetes API. Pods are
/// read and written by name within one namespace; watches are delivered
/// separately through the pod awaiter.
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    async fn read_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Pod>, ApiFailure>;

    async fn create_pod(
        &self,
        namespace: &str,
        pod: &corev1::Pod,
    ) -> Result<corev1::Pod, ApiFailure>;

    /// Applies an RFC 6902 JSON-Patch. Merge-patch is deliberately absent
    /// from this interface; it would null out server-defaulted fields.
    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<corev1::Pod, ApiFailure>;

    /// Deletion is idempotent: a missing pod is a success.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: i64,
    ) -> Result<(), ApiFailure>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<corev1::Pod>, ApiFailure>;

    async fn replace_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<(), ApiFailure>;
}
