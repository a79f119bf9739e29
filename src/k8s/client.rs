use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use kube_core::ErrorResponse;
use tracing::debug;

use super::{ApiFailure, KubernetesApi};
use crate::domain::{Domain, DomainStatus};

/// Production implementation of [`KubernetesApi`] over kube-rs.
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    pub fn new(client: Client) -> Self {
        KubeApi { client }
    }

    fn pods(&self, namespace: &str) -> Api<corev1::Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn domains(&self, namespace: &str) -> Api<Domain> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Maps a kube-rs error to the classified failure kinds the kernel
/// understands. The API server identifies the kind by reason string.
pub fn classify(error: kube::Error) -> ApiFailure {
    match error {
        kube::Error::Api(ErrorResponse { reason, code, message, .. }) => match reason.as_str() {
            "NotFound" => ApiFailure::NotFound,
            "AlreadyExists" => ApiFailure::AlreadyExists,
            "Conflict" => ApiFailure::Conflict,
            "BadRequest" | "Invalid" | "Forbidden" => ApiFailure::Invalid(message),
            _ if code == 429 => ApiFailure::Throttled,
            _ if code >= 500 => ApiFailure::Server(code),
            _ => ApiFailure::Invalid(message),
        },
        other => ApiFailure::Transport(other.to_string()),
    }
}

#[async_trait]
impl KubernetesApi for KubeApi {
    async fn read_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Pod>, ApiFailure> {
        self.pods(namespace).get_opt(name).await.map_err(classify)
    }

    async fn create_pod(
        &self,
        namespace: &str,
        pod: &corev1::Pod,
    ) -> Result<corev1::Pod, ApiFailure> {
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(classify)
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<corev1::Pod, ApiFailure> {
        self.pods(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Json::<()>(patch.clone()),
            )
            .await
            .map_err(classify)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: i64,
    ) -> Result<(), ApiFailure> {
        let dp = DeleteParams {
            grace_period_seconds: Some(grace_period_seconds.max(0) as u32),
            ..DeleteParams::default()
        };
        match self.pods(namespace).delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(e) => match classify(e) {
                ApiFailure::NotFound => {
                    debug!(pod = name, "delete found no pod, treating as done");
                    Ok(())
                }
                failure => Err(failure),
            },
        }
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<corev1::Pod>, ApiFailure> {
        let lp = ListParams::default().labels(label_selector);
        self.pods(namespace)
            .list(&lp)
            .await
            .map(|l| l.items)
            .map_err(classify)
    }

    async fn replace_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<(), ApiFailure> {
        let api = self.domains(namespace);
        let mut domain = api.get(name).await.map_err(classify)?;
        domain.status = Some(status.clone());
        let data = serde_json::to_vec(&domain)
            .map_err(|e| ApiFailure::Invalid(format!("domain status did not serialize: {e}")))?;
        api.replace_status(name, &PostParams::default(), data)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(reason: &str, code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_by_reason_string() {
        assert_eq!(classify(api_error("NotFound", 404)), ApiFailure::NotFound);
        assert_eq!(classify(api_error("Conflict", 409)), ApiFailure::Conflict);
        assert_eq!(
            classify(api_error("AlreadyExists", 409)),
            ApiFailure::AlreadyExists
        );
        assert_eq!(classify(api_error("TooManyRequests", 429)), ApiFailure::Throttled);
        assert_eq!(classify(api_error("InternalError", 500)), ApiFailure::Server(500));
    }

    #[test]
    fn only_throttle_and_server_failures_retry() {
        assert!(ApiFailure::Throttled.is_retryable());
        assert!(ApiFailure::Server(503).is_retryable());
        assert!(ApiFailure::Transport("reset".to_string()).is_retryable());
        assert!(!ApiFailure::Conflict.is_retryable());
        assert!(!ApiFailure::NotFound.is_retryable());
    }
}
