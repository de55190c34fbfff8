//! Cluster orchestrator access.
//!
//! The control plane is reached through `kubectl` against the merged host
//! kubeconfig — building a handle from the machine-generated credentials
//! file, fetching workload objects, and reducing them to observations via
//! the per-kind viewers. Kubeconfig merge/removal itself is a
//! mapping-level YAML operation, no client library involved.

pub mod viewers;

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use serde_yaml::Mapping;
use tokio::process::Command;

use crate::cluster::CredentialsStore;
use crate::cluster::readiness::{WorkloadObservation, WorkloadSource};
use crate::errors::{KubenestError, KubenestResult};
use crate::machine::{self, MachinePlatform};

/// Path of the kubeconfig the in-machine bootstrapper generates.
pub const MACHINE_KUBECONFIG: &str = "/root/.kube/config";

/// Host kubeconfig location (`~/.kube/config`).
pub fn home_kubeconfig() -> KubenestResult<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or_else(|| KubenestError::Kube("cannot determine home directory".into()))
}

fn named_sections() -> [&'static str; 3] {
    ["clusters", "contexts", "users"]
}

fn entry_name(entry: &serde_yaml::Value) -> Option<&str> {
    entry.get("name").and_then(serde_yaml::Value::as_str)
}

/// Merge the machine's kubeconfig into the host one.
///
/// Entries are matched by name within each named section; the machine's
/// entries win, as does its current-context.
pub(crate) fn merge_documents(
    machine_cfg: serde_yaml::Value,
    home_cfg: Option<serde_yaml::Value>,
) -> serde_yaml::Value {
    let mut merged = home_cfg.unwrap_or_else(|| {
        let mut base = Mapping::new();
        base.insert("apiVersion".into(), "v1".into());
        base.insert("kind".into(), "Config".into());
        serde_yaml::Value::Mapping(base)
    });

    for section in named_sections() {
        let incoming: Vec<serde_yaml::Value> = machine_cfg
            .get(section)
            .and_then(serde_yaml::Value::as_sequence)
            .cloned()
            .unwrap_or_default();
        if incoming.is_empty() {
            continue;
        }
        let incoming_names: Vec<String> = incoming
            .iter()
            .filter_map(|e| entry_name(e).map(str::to_string))
            .collect();

        let Some(mapping) = merged.as_mapping_mut() else {
            continue;
        };
        let existing = mapping
            .entry(section.into())
            .or_insert_with(|| serde_yaml::Value::Sequence(vec![]));
        if let Some(seq) = existing.as_sequence_mut() {
            seq.retain(|e| {
                entry_name(e).is_none_or(|name| !incoming_names.iter().any(|n| n == name))
            });
            seq.extend(incoming);
        }
    }

    if let Some(current) = machine_cfg.get("current-context").cloned() {
        if let Some(mapping) = merged.as_mapping_mut() {
            mapping.insert("current-context".into(), current);
        }
    }
    merged
}

/// Drop the named cluster/context/user triplet from a kubeconfig.
pub(crate) fn remove_entries(mut config: serde_yaml::Value, name: &str) -> serde_yaml::Value {
    for section in named_sections() {
        if let Some(seq) = config
            .get_mut(section)
            .and_then(serde_yaml::Value::as_sequence_mut)
        {
            seq.retain(|e| entry_name(e) != Some(name));
        }
    }
    let points_at_removed = config
        .get("current-context")
        .and_then(serde_yaml::Value::as_str)
        == Some(name);
    if points_at_removed {
        if let Some(mapping) = config.as_mapping_mut() {
            mapping.insert("current-context".into(), "".into());
        }
    }
    config
}

/// Read the machine-generated kubeconfig and merge it into `~/.kube/config`.
pub async fn merge_kubeconfig(platform: &dyn MachinePlatform, name: &str) -> KubenestResult<()> {
    let raw = machine::read_file(platform, name, MACHINE_KUBECONFIG).await?;
    let machine_cfg: serde_yaml::Value = serde_yaml::from_str(&raw)?;

    let target = home_kubeconfig()?;
    let home_cfg = match std::fs::read_to_string(&target) {
        Ok(content) => Some(serde_yaml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let merged = merge_documents(machine_cfg, home_cfg);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::debug!(machine = %name, kubeconfig = %target.display(), "writing merged kubeconfig");
    std::fs::write(&target, serde_yaml::to_string(&merged)?)?;
    Ok(())
}

/// Remove the machine's entries from `~/.kube/config`. Missing files and
/// missing entries are fine.
pub fn remove_kubeconfig(name: &str) -> KubenestResult<()> {
    let target = home_kubeconfig()?;
    let content = match std::fs::read_to_string(&target) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let config: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let cleaned = remove_entries(config, name);
    std::fs::write(&target, serde_yaml::to_string(&cleaned)?)?;
    Ok(())
}

/// Credentials store over the host kubeconfig, wired into the lifecycle
/// driver by the CLI.
pub struct KubeCredentials<'a> {
    pub platform: &'a dyn MachinePlatform,
}

#[async_trait]
impl CredentialsStore for KubeCredentials<'_> {
    async fn merge(&self, name: &str) -> KubenestResult<()> {
        merge_kubeconfig(self.platform, name).await
    }

    fn remove(&self, name: &str) -> KubenestResult<()> {
        remove_kubeconfig(name)
    }
}

/// Handle on the cluster's control plane, built from the merged credentials.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    kubeconfig: PathBuf,
    context: String,
}

impl ClusterHandle {
    /// Build a handle for the named machine's cluster. Fails when the merged
    /// kubeconfig does not exist yet.
    pub fn for_machine(name: &str) -> KubenestResult<ClusterHandle> {
        let kubeconfig = home_kubeconfig()?;
        if !kubeconfig.exists() {
            return Err(KubenestError::Kube(format!(
                "kubeconfig {} not found; has the cluster been started?",
                kubeconfig.display()
            )));
        }
        Ok(ClusterHandle {
            kubeconfig,
            context: name.to_string(),
        })
    }

    async fn kubectl(&self, args: &[&str]) -> KubenestResult<std::process::Output> {
        let mut cmd = Command::new("kubectl");
        cmd.arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .arg("--context")
            .arg(&self.context)
            .args(args)
            .stdin(Stdio::null());
        cmd.output()
            .await
            .map_err(|e| KubenestError::Kube(format!("spawning kubectl: {e}")))
    }

    async fn get_json(&self, args: &[&str]) -> KubenestResult<Value> {
        let output = self.kubectl(args).await?;
        if !output.status.success() {
            return Err(KubenestError::Kube(format!(
                "kubectl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Whether the Argo CD Application CRD is installed.
    pub async fn has_applications(&self) -> KubenestResult<bool> {
        let output = self
            .kubectl(&["get", "crd", "applications.argoproj.io"])
            .await?;
        Ok(output.status.success())
    }
}

/// Reduce a kubectl `List` into sorted observations via the viewer table.
pub(crate) fn observations_from_list(list: &Value) -> KubenestResult<Vec<WorkloadObservation>> {
    let items = list
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| KubenestError::Kube("workload list has no items".into()))?;

    let mut result = Vec::with_capacity(items.len());
    for item in items {
        let kind = item.get("kind").and_then(Value::as_str).unwrap_or("");
        let viewer = viewers::viewer_for(kind)?;
        let (message, healthy) = viewer.status(item)?;
        let namespace = item
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("default");
        let name = item
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>");
        let lowered = format!("{}/{name}", kind.to_lowercase());
        result.push(WorkloadObservation::new(
            namespace,
            &lowered,
            healthy,
            message.trim_end_matches('\n'),
        ));
    }
    result.sort_by_key(|o| o.key());
    Ok(result)
}

/// Workload source backed by kubectl.
pub struct KubectlSource {
    handle: ClusterHandle,
}

impl KubectlSource {
    pub fn new(handle: ClusterHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl WorkloadSource for KubectlSource {
    async fn observe(&self) -> KubenestResult<Vec<WorkloadObservation>> {
        let mut resource_types = "deployments,statefulsets,daemonsets".to_string();
        if self.handle.has_applications().await? {
            resource_types.push_str(",applications");
        }
        let list = self
            .handle
            .get_json(&["get", &resource_types, "--all-namespaces", "-o", "json"])
            .await?;
        observations_from_list(&list)
    }
}

/// Whether the pod's `Ready` condition is true.
pub(crate) fn is_pod_ready(pod: &Value) -> bool {
    pod.pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Classify one pod into a workload observation: running+ready is healthy,
/// pending/unknown/unready is transient, anything else is terminal.
pub(crate) fn observe_pod(pod: &Value) -> WorkloadObservation {
    let namespace = pod
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or("default");
    let name = pod
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>");
    let phase = pod
        .pointer("/status/phase")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");

    match phase {
        "Running" if is_pod_ready(pod) => {
            WorkloadObservation::new(namespace, name, true, "pod ready")
        }
        "Running" => WorkloadObservation::new(namespace, name, false, "pod not ready"),
        "Pending" | "Unknown" => {
            WorkloadObservation::new(namespace, name, false, &format!("pod {phase}"))
        }
        terminal => {
            let mut o =
                WorkloadObservation::new(namespace, name, false, &format!("pod {terminal}"));
            o.failed = true;
            o
        }
    }
}

/// Workload source over pods, used for the fine-grained 1s wait.
pub struct PodSource {
    handle: ClusterHandle,
}

impl PodSource {
    pub fn new(handle: ClusterHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl WorkloadSource for PodSource {
    async fn observe(&self) -> KubenestResult<Vec<WorkloadObservation>> {
        let list = self
            .handle
            .get_json(&["get", "pods", "--all-namespaces", "-o", "json"])
            .await?;
        let items = list
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| KubenestError::Kube("pod list has no items".into()))?;
        let mut observations: Vec<WorkloadObservation> = items.iter().map(observe_pod).collect();
        observations.sort_by_key(|o| o.key());
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).expect("yaml")
    }

    #[test]
    fn merge_into_empty_home_config() {
        let machine_cfg = yaml(
            "clusters:\n- name: nest\n  cluster: {server: 'https://192.168.67.2:6443'}\ncontexts:\n- name: nest\n  context: {cluster: nest, user: nest}\nusers:\n- name: nest\n  user: {}\ncurrent-context: nest\n",
        );
        let merged = merge_documents(machine_cfg, None);
        assert_eq!(
            merged.get("current-context").and_then(serde_yaml::Value::as_str),
            Some("nest")
        );
        assert_eq!(merged["clusters"].as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn merge_replaces_entries_with_same_name() {
        let machine_cfg = yaml(
            "clusters:\n- name: nest\n  cluster: {server: 'https://new:6443'}\ncurrent-context: nest\n",
        );
        let home_cfg = yaml(
            "clusters:\n- name: nest\n  cluster: {server: 'https://old:6443'}\n- name: other\n  cluster: {server: 'https://other:6443'}\ncurrent-context: other\n",
        );
        let merged = merge_documents(machine_cfg, Some(home_cfg));
        let clusters = merged["clusters"].as_sequence().unwrap();
        assert_eq!(clusters.len(), 2);
        let nest = clusters
            .iter()
            .find(|c| entry_name(c) == Some("nest"))
            .unwrap();
        assert_eq!(
            nest["cluster"]["server"].as_str(),
            Some("https://new:6443")
        );
        assert_eq!(
            merged.get("current-context").and_then(serde_yaml::Value::as_str),
            Some("nest")
        );
    }

    #[test]
    fn remove_drops_triplet_and_clears_current_context() {
        let config = yaml(
            "clusters:\n- name: nest\n  cluster: {}\n- name: other\n  cluster: {}\ncontexts:\n- name: nest\n  context: {}\nusers:\n- name: nest\n  user: {}\ncurrent-context: nest\n",
        );
        let cleaned = remove_entries(config, "nest");
        assert_eq!(cleaned["clusters"].as_sequence().unwrap().len(), 1);
        assert!(cleaned["contexts"].as_sequence().unwrap().is_empty());
        assert_eq!(
            cleaned.get("current-context").and_then(serde_yaml::Value::as_str),
            Some("")
        );
    }

    #[test]
    fn builds_observations_from_workload_list() {
        let list = json!({
            "items": [
                {
                    "kind": "Deployment",
                    "metadata": {"name": "coredns", "namespace": "kube-system", "generation": 1},
                    "spec": {"replicas": 1},
                    "status": {"observedGeneration": 1, "updatedReplicas": 1, "readyReplicas": 1, "replicas": 1}
                },
                {
                    "kind": "DaemonSet",
                    "metadata": {"name": "kube-proxy", "namespace": "kube-system", "generation": 1},
                    "status": {"observedGeneration": 1, "desiredNumberScheduled": 1, "updatedNumberScheduled": 1, "numberReady": 0}
                }
            ]
        });
        let observations = observations_from_list(&list).unwrap();
        assert_eq!(observations.len(), 2);
        assert!(observations[0].key() < observations[1].key());
        assert_eq!(observations.iter().filter(|o| o.healthy).count(), 1);
    }

    #[test]
    fn pod_partition_matches_phase_semantics() {
        let ready = json!({
            "metadata": {"name": "a", "namespace": "ns"},
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
        });
        let unready = json!({
            "metadata": {"name": "b", "namespace": "ns"},
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "False"}]}
        });
        let pending = json!({
            "metadata": {"name": "c", "namespace": "ns"},
            "status": {"phase": "Pending"}
        });
        let stopped = json!({
            "metadata": {"name": "d", "namespace": "ns"},
            "status": {"phase": "Failed"}
        });

        assert!(observe_pod(&ready).healthy);
        let o = observe_pod(&unready);
        assert!(!o.healthy && !o.failed);
        let o = observe_pod(&pending);
        assert!(!o.healthy && !o.failed);
        let o = observe_pod(&stopped);
        assert!(!o.healthy && o.failed);
    }
}
