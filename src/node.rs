use std::collections::HashMap;

/// Label carrying the canonical service name of a workload.
pub const CANONICAL_SERVICE_LABEL: &str = "canonical-service";
/// Label carrying the canonical service revision of a workload.
pub const CANONICAL_REVISION_LABEL: &str = "canonical-revision";
/// Fallback revision value when no revision label is present.
pub const LATEST_REVISION: &str = "latest";

/// Platform metadata key for the hosting project.
pub const PLATFORM_PROJECT_KEY: &str = "project";
/// Platform metadata key for the cluster location.
pub const PLATFORM_CLUSTER_LOCATION_KEY: &str = "cluster_location";
/// Platform metadata key for the cluster name.
pub const PLATFORM_CLUSTER_NAME_KEY: &str = "cluster_name";

/// Owned, immutable snapshot of a node's identity metadata.
///
/// Captured once per configuration from the external metadata source and
/// read-only afterwards. Peer nodes resolved through metadata exchange use
/// the same shape.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct NodeMetadata {
    /// Instance name (e.g. pod name).
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Owner resource uid (e.g. a deployment).
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub workload_name: String,
    /// Mesh software version running on the node.
    #[serde(default)]
    pub mesh_version: String,
    /// Workload labels ("app", "version", canonical service labels, ...).
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Platform metadata (project, cluster location, cluster name).
    #[serde(default)]
    pub platform_metadata: HashMap<String, String>,
}

impl NodeMetadata {
    /// Returns the value of a label, or `None` when absent.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Returns a platform metadata value, or an empty string when absent.
    pub fn platform(&self, key: &str) -> &str {
        self.platform_metadata
            .get(key)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Canonical service name: the canonical-service label, falling back to
    /// the "app" label, falling back to the workload name.
    pub fn canonical_service(&self) -> &str {
        self.label(CANONICAL_SERVICE_LABEL)
            .or_else(|| self.label("app"))
            .unwrap_or(&self.workload_name)
    }

    /// Canonical service revision: the canonical-revision label, falling
    /// back to "latest".
    pub fn canonical_revision(&self) -> &str {
        self.label(CANONICAL_REVISION_LABEL)
            .unwrap_or(LATEST_REVISION)
    }
}

/// A workload instance participating in a traffic assertion.
///
/// Derived from node metadata; the uid encodes the orchestrator scheme so
/// instances remain comparable across reporters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadInstance {
    pub uid: String,
    pub location: String,
    pub cluster_name: String,
    pub owner_uid: String,
    pub workload_name: String,
    pub workload_namespace: String,
}

impl WorkloadInstance {
    /// Builds a workload instance from node metadata.
    pub fn from_metadata(node: &NodeMetadata) -> Self {
        Self {
            uid: format!("kubernetes://{}.{}", node.name, node.namespace),
            location: node.platform(PLATFORM_CLUSTER_LOCATION_KEY).to_string(),
            cluster_name: node.platform(PLATFORM_CLUSTER_NAME_KEY).to_string(),
            owner_uid: node.owner.clone(),
            workload_name: node.workload_name.clone(),
            workload_namespace: node.namespace.clone(),
        }
    }
}

/// Mesh identity carried on every report batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshIdentity {
    /// Parent resource of emitted batches ("projects/<project>").
    pub parent: String,
    /// Mesh uid ("<project>/<location>/meshes/<cluster>").
    pub mesh_uid: String,
}

impl MeshIdentity {
    /// Derives the mesh identity from local node metadata.
    pub fn from_metadata(node: &NodeMetadata) -> Self {
        let project = node.platform(PLATFORM_PROJECT_KEY);
        let location = node.platform(PLATFORM_CLUSTER_LOCATION_KEY);
        let cluster = node.platform(PLATFORM_CLUSTER_NAME_KEY);
        Self {
            parent: format!("projects/{project}"),
            mesh_uid: format!("{project}/{location}/meshes/{cluster}"),
        }
    }
}
