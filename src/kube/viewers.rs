//! Per-kind workload status extraction.
//!
//! Each supported kind gets a viewer that reduces the raw object JSON to a
//! human message plus a healthy flag — a strategy table keyed by kind, with
//! unknown kinds reported as an error rather than guessed at.

use serde_json::Value;

use crate::errors::{KubenestError, KubenestResult};

pub trait StatusViewer: Send + Sync {
    /// Reduce one object to `(message, healthy)`.
    fn status(&self, obj: &Value) -> KubenestResult<(String, bool)>;
}

/// Viewer lookup. Kinds outside the table are a caller bug (the fetch only
/// requests kinds listed here), surfaced as an error.
pub fn viewer_for(kind: &str) -> KubenestResult<&'static dyn StatusViewer> {
    static DEPLOYMENT: DeploymentViewer = DeploymentViewer;
    static STATEFUL_SET: StatefulSetViewer = StatefulSetViewer;
    static DAEMON_SET: DaemonSetViewer = DaemonSetViewer;
    static APPLICATION: ApplicationViewer = ApplicationViewer;

    match kind {
        "Deployment" => Ok(&DEPLOYMENT),
        "StatefulSet" => Ok(&STATEFUL_SET),
        "DaemonSet" => Ok(&DAEMON_SET),
        "Application" => Ok(&APPLICATION),
        other => Err(KubenestError::Kube(format!(
            "no status viewer for kind {other}"
        ))),
    }
}

fn name_of(obj: &Value) -> String {
    obj.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
        .to_string()
}

fn int_at(obj: &Value, pointer: &str) -> i64 {
    obj.pointer(pointer).and_then(Value::as_i64).unwrap_or(0)
}

fn str_at<'a>(obj: &'a Value, pointer: &str) -> &'a str {
    obj.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

fn generation_observed(obj: &Value) -> bool {
    int_at(obj, "/status/observedGeneration") >= int_at(obj, "/metadata/generation")
}

pub struct DeploymentViewer;

impl StatusViewer for DeploymentViewer {
    fn status(&self, obj: &Value) -> KubenestResult<(String, bool)> {
        let name = name_of(obj);
        if !generation_observed(obj) {
            return Ok((format!("deployment \"{name}\" spec update to be observed"), false));
        }
        let desired = obj
            .pointer("/spec/replicas")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let updated = int_at(obj, "/status/updatedReplicas");
        let ready = int_at(obj, "/status/readyReplicas");
        let total = int_at(obj, "/status/replicas");

        if updated < desired {
            Ok((
                format!("deployment \"{name}\": {updated} out of {desired} new replicas updated"),
                false,
            ))
        } else if total > updated {
            Ok((
                format!("deployment \"{name}\": {} old replicas pending termination", total - updated),
                false,
            ))
        } else if ready < desired {
            Ok((
                format!("deployment \"{name}\": {ready} of {desired} replicas ready"),
                false,
            ))
        } else {
            Ok((format!("deployment \"{name}\" successfully rolled out"), true))
        }
    }
}

pub struct StatefulSetViewer;

impl StatusViewer for StatefulSetViewer {
    fn status(&self, obj: &Value) -> KubenestResult<(String, bool)> {
        let name = name_of(obj);
        if !generation_observed(obj) {
            return Ok((format!("statefulset \"{name}\" spec update to be observed"), false));
        }
        let desired = obj
            .pointer("/spec/replicas")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let ready = int_at(obj, "/status/readyReplicas");
        let current = str_at(obj, "/status/currentRevision");
        let update = str_at(obj, "/status/updateRevision");

        if ready < desired {
            Ok((
                format!("statefulset \"{name}\": {ready} of {desired} replicas ready"),
                false,
            ))
        } else if current != update {
            Ok((
                format!("statefulset \"{name}\": revision rollout in progress"),
                false,
            ))
        } else {
            Ok((format!("statefulset \"{name}\" rolling update complete"), true))
        }
    }
}

pub struct DaemonSetViewer;

impl StatusViewer for DaemonSetViewer {
    fn status(&self, obj: &Value) -> KubenestResult<(String, bool)> {
        let name = name_of(obj);
        if !generation_observed(obj) {
            return Ok((format!("daemonset \"{name}\" spec update to be observed"), false));
        }
        let desired = int_at(obj, "/status/desiredNumberScheduled");
        let updated = int_at(obj, "/status/updatedNumberScheduled");
        let ready = int_at(obj, "/status/numberReady");

        if updated < desired {
            Ok((
                format!("daemonset \"{name}\": {updated} out of {desired} new pods updated"),
                false,
            ))
        } else if ready < desired {
            Ok((
                format!("daemonset \"{name}\": {ready} of {desired} pods ready"),
                false,
            ))
        } else {
            Ok((format!("daemonset \"{name}\" successfully rolled out"), true))
        }
    }
}

/// Argo CD Application: healthy iff synced and healthy.
pub struct ApplicationViewer;

impl StatusViewer for ApplicationViewer {
    fn status(&self, obj: &Value) -> KubenestResult<(String, bool)> {
        let name = name_of(obj);
        let health = str_at(obj, "/status/health/status");
        let sync = str_at(obj, "/status/sync/status");
        let msg = format!("application \"{name}\" sync status: {sync}, health status: {health}");
        Ok((msg, health == "Healthy" && sync == "Synced"))
    }
}
