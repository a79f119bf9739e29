use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use serde::{Deserialize, Serialize};

use crate::domain::{Domain, ServerPodConfig};
use crate::error::OperatorError;

/// Grace added on top of the configured shutdown timeout when deleting a
/// server pod, covering WLST startup and connect latency so the server
/// instance gets its full timeout to stop before the container is killed.
pub const DEFAULT_ADDITIONAL_DELETE_SECONDS: i64 = 10;

const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: i64 = 30;

/// Immutable view of the user's declared state for one domain. A
/// reconciliation fiber refers to a single snapshot for its whole lifetime;
/// a newer edit produces a new snapshot and a new fiber.
#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub domain_uid: String,
    pub namespace: String,
    pub resource_name: String,
    pub resource_uid: String,
    pub generation: i64,
    pub image: String,
    pub image_pull_policy: String,
    pub introspect_version: Option<String>,
    pub admin_server: ServerSpec,
    pub clusters: Vec<ClusterSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub name: String,
    pub replicas: i32,
    pub max_unavailable: i32,
    pub size: Option<i32>,
    pub server_template: ServerSpec,
}

/// Per-server pod customization, already merged across the domain, cluster
/// and server levels.
#[derive(Debug, Clone, Default)]
pub struct ServerSpec {
    pub env: Vec<corev1::EnvVar>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub resource_requests: BTreeMap<String, String>,
    pub resource_limits: BTreeMap<String, String>,
    pub shutdown_timeout_seconds: i64,
}

impl ServerSpec {
    pub fn delete_grace_period_seconds(&self) -> i64 {
        self.shutdown_timeout_seconds + DEFAULT_ADDITIONAL_DELETE_SECONDS
    }
}

impl DomainSnapshot {
    /// Builds a snapshot from the live custom resource. Returns a
    /// validation error when identity fields are missing.
    pub fn from_domain(domain: &Domain) -> Result<DomainSnapshot, OperatorError> {
        let name = domain
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::Validation("domain misses .metadata.name".to_string()))?;
        let namespace = domain.metadata.namespace.clone().ok_or_else(|| {
            OperatorError::Validation("domain misses .metadata.namespace".to_string())
        })?;

        let spec = &domain.spec;
        let domain_level = spec.server_pod.clone().unwrap_or_default();
        let admin_level = spec
            .admin_server
            .as_ref()
            .and_then(|a| a.server_pod.clone())
            .unwrap_or_default();

        let clusters = spec
            .clusters
            .iter()
            .map(|c| ClusterSnapshot {
                name: c.name.clone(),
                replicas: c.replicas.max(0),
                max_unavailable: c.max_unavailable.unwrap_or(1).max(1),
                size: c.size,
                server_template: merge_server_spec(
                    &domain_level,
                    c.server_pod.as_ref().unwrap_or(&ServerPodConfig::default()),
                ),
            })
            .collect();

        Ok(DomainSnapshot {
            domain_uid: spec.domain_uid.clone().unwrap_or_else(|| name.clone()),
            namespace,
            resource_name: name,
            resource_uid: domain.metadata.uid.clone().unwrap_or_default(),
            generation: domain.metadata.generation.unwrap_or(0),
            image: spec.image.clone(),
            image_pull_policy: spec
                .image_pull_policy
                .clone()
                .unwrap_or_else(|| "IfNotPresent".to_string()),
            introspect_version: spec.introspect_version.clone(),
            admin_server: merge_server_spec(&domain_level, &admin_level),
            clusters,
        })
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterSnapshot> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Resolved pod customization for one server.
    pub fn server_spec(&self, cluster: Option<&str>) -> &ServerSpec {
        match cluster.and_then(|c| self.cluster(c)) {
            Some(c) => &c.server_template,
            None => &self.admin_server,
        }
    }

    /// Rejects replica counts the topology cannot satisfy. Clusters absent
    /// from the topology are rejected as well.
    pub fn validate_against(&self, topology: &DomainTopology) -> Result<(), OperatorError> {
        for cluster in &self.clusters {
            let members = topology
                .cluster(&cluster.name)
                .map(|c| c.servers.len() as i32)
                .ok_or_else(|| {
                    OperatorError::Validation(format!(
                        "cluster {} is not part of the domain configuration",
                        cluster.name
                    ))
                })?;
            if cluster.replicas > members {
                return Err(OperatorError::Validation(format!(
                    "cluster {} requests {} replicas but the configuration defines only {} servers",
                    cluster.name, cluster.replicas, members
                )));
            }
        }
        Ok(())
    }
}

fn merge_server_spec(base: &ServerPodConfig, overlay: &ServerPodConfig) -> ServerSpec {
    let mut env: Vec<corev1::EnvVar> = Vec::new();
    for var in base.env.iter().chain(overlay.env.iter()) {
        env.retain(|e| e.name != var.name);
        env.push(corev1::EnvVar {
            name: var.name.clone(),
            value: Some(var.value.clone()),
            ..corev1::EnvVar::default()
        });
    }

    let mut labels = base.labels.clone();
    labels.extend(overlay.labels.clone());
    let mut annotations = base.annotations.clone();
    annotations.extend(overlay.annotations.clone());
    let mut resource_requests = base.resource_requests.clone();
    resource_requests.extend(overlay.resource_requests.clone());
    let mut resource_limits = base.resource_limits.clone();
    resource_limits.extend(overlay.resource_limits.clone());

    ServerSpec {
        env,
        labels,
        annotations,
        resource_requests,
        resource_limits,
        shutdown_timeout_seconds: overlay
            .shutdown_timeout_seconds
            .or(base.shutdown_timeout_seconds)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
    }
}

/// Parsed output of an introspector run: the servers the domain
/// configuration actually defines, with their ports.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainTopology {
    pub domain_name: String,
    pub admin_server: ServerTopology,
    #[serde(default)]
    pub clusters: Vec<ClusterTopology>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub name: String,
    pub servers: Vec<ServerTopology>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTopology {
    pub name: String,
    pub listen_port: i32,
    #[serde(default)]
    pub admin_port: Option<i32>,
}

impl DomainTopology {
    pub fn cluster(&self, name: &str) -> Option<&ClusterTopology> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Contract with the introspector subsystem: produce topology or fail.
#[async_trait]
pub trait Introspector: Send + Sync {
    async fn introspect(&self, snapshot: &DomainSnapshot)
        -> Result<DomainTopology, OperatorError>;
}

/// Results of past introspections, keyed by domain, together with the
/// introspect version they were produced at. A domain whose declared
/// version has moved past its cache entry must re-introspect before the
/// admin server may be rebuilt; a cache hit at the same version lets a
/// reconciliation skip the introspector entirely.
#[derive(Clone, Default)]
pub struct TopologyCache {
    inner: Arc<Mutex<HashMap<String, CachedIntrospection>>>,
}

struct CachedIntrospection {
    introspect_version: Option<String>,
    topology: Arc<DomainTopology>,
}

impl TopologyCache {
    pub fn lookup(&self, key: &str) -> Option<(Option<String>, Arc<DomainTopology>)> {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .map(|cached| (cached.introspect_version.clone(), cached.topology.clone()))
    }

    pub fn store(
        &self,
        key: &str,
        introspect_version: Option<String>,
        topology: Arc<DomainTopology>,
    ) {
        self.inner.lock().unwrap().insert(
            key.to_string(),
            CachedIntrospection {
                introspect_version,
                topology,
            },
        );
    }
}

/// Derives the topology directly from the declared cluster sizes. Stands in
/// for the job-based introspector wherever the domain home layout is fully
/// described by the resource.
pub struct SpecDerivedTopology;

#[async_trait]
impl Introspector for SpecDerivedTopology {
    async fn introspect(
        &self,
        snapshot: &DomainSnapshot,
    ) -> Result<DomainTopology, OperatorError> {
        let clusters = snapshot
            .clusters
            .iter()
            .map(|c| ClusterTopology {
                name: c.name.clone(),
                servers: (1..=c.size.unwrap_or(c.replicas).max(c.replicas))
                    .map(|n| ServerTopology {
                        name: format!("{}-managed-server{}", c.name, n),
                        listen_port: 8001,
                        admin_port: None,
                    })
                    .collect(),
            })
            .collect();

        Ok(DomainTopology {
            domain_name: snapshot.domain_uid.clone(),
            admin_server: ServerTopology {
                name: "admin-server".to_string(),
                listen_port: 7001,
                admin_port: None,
            },
            clusters,
        })
    }
}
