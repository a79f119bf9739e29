use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The Domain custom resource: one administrative server plus zero or more
/// clusters of managed servers, all running the same WebLogic image.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "weblogic.oracle", version = "v9", kind = "Domain")]
#[kube(shortname = "dom", namespaced, status = "DomainStatus")]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Identity of the domain. Defaults to the resource name.
    pub domain_uid: Option<String>,
    pub image: String,
    pub image_pull_policy: Option<String>,
    /// Bumped by the user to force a re-introspection of the domain home.
    pub introspect_version: Option<String>,
    pub admin_server: Option<AdminServerConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Domain-wide pod customizations, overridden per cluster.
    pub server_pod: Option<ServerPodConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminServerConfig {
    pub server_pod: Option<ServerPodConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    pub replicas: i32,
    /// Maximum cluster members allowed to be not-ready during a roll.
    pub max_unavailable: Option<i32>,
    /// Configured size of the cluster in the WebLogic config. Replicas
    /// beyond this bound are a validation failure.
    pub size: Option<i32>,
    pub server_pod: Option<ServerPodConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerPodConfig {
    pub env: Vec<EnvVarConfig>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub resource_requests: BTreeMap<String, String>,
    pub resource_limits: BTreeMap<String, String>,
    /// Seconds a server instance is given to shut down gracefully.
    pub shutdown_timeout_seconds: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarConfig {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainStatus {
    pub observed_generation: Option<i64>,
    pub conditions: Vec<DomainCondition>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DomainCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    Completed,
    Available,
    Failed,
}

impl DomainStatus {
    /// Replaces any condition of the same type; at most one condition per
    /// type is kept.
    pub fn upsert_condition(&mut self, condition: DomainCondition) {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }

    pub fn remove_condition(&mut self, type_: ConditionType) {
        self.conditions.retain(|c| c.type_ != type_);
    }
}
