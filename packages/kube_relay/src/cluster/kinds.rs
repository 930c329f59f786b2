//! Watchable object kinds and their REST locations.

use crate::error::WatchError;

/// REST coordinates of one object kind
#[derive(Debug, PartialEq, Eq)]
pub struct KindInfo {
    /// Canonical lowercase kind name used in topic keys
    pub name: &'static str,
    /// API group; empty for the core group
    pub group: &'static str,
    pub version: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
    /// Short names accepted in addition to the name and plural
    pub aliases: &'static [&'static str],
}

const KINDS: &[KindInfo] = &[
    KindInfo {
        name: "pod",
        group: "",
        version: "v1",
        plural: "pods",
        namespaced: true,
        aliases: &["po"],
    },
    KindInfo {
        name: "service",
        group: "",
        version: "v1",
        plural: "services",
        namespaced: true,
        aliases: &["svc"],
    },
    KindInfo {
        name: "configmap",
        group: "",
        version: "v1",
        plural: "configmaps",
        namespaced: true,
        aliases: &["cm"],
    },
    KindInfo {
        name: "secret",
        group: "",
        version: "v1",
        plural: "secrets",
        namespaced: true,
        aliases: &[],
    },
    KindInfo {
        name: "persistentvolumeclaim",
        group: "",
        version: "v1",
        plural: "persistentvolumeclaims",
        namespaced: true,
        aliases: &["pvc"],
    },
    KindInfo {
        name: "persistentvolume",
        group: "",
        version: "v1",
        plural: "persistentvolumes",
        namespaced: false,
        aliases: &["pv"],
    },
    KindInfo {
        name: "namespace",
        group: "",
        version: "v1",
        plural: "namespaces",
        namespaced: false,
        aliases: &["ns"],
    },
    KindInfo {
        name: "node",
        group: "",
        version: "v1",
        plural: "nodes",
        namespaced: false,
        aliases: &["no"],
    },
    KindInfo {
        name: "event",
        group: "",
        version: "v1",
        plural: "events",
        namespaced: true,
        aliases: &["ev"],
    },
    KindInfo {
        name: "deployment",
        group: "apps",
        version: "v1",
        plural: "deployments",
        namespaced: true,
        aliases: &["deploy"],
    },
    KindInfo {
        name: "statefulset",
        group: "apps",
        version: "v1",
        plural: "statefulsets",
        namespaced: true,
        aliases: &["sts"],
    },
    KindInfo {
        name: "daemonset",
        group: "apps",
        version: "v1",
        plural: "daemonsets",
        namespaced: true,
        aliases: &["ds"],
    },
    KindInfo {
        name: "replicaset",
        group: "apps",
        version: "v1",
        plural: "replicasets",
        namespaced: true,
        aliases: &["rs"],
    },
    KindInfo {
        name: "job",
        group: "batch",
        version: "v1",
        plural: "jobs",
        namespaced: true,
        aliases: &[],
    },
    KindInfo {
        name: "cronjob",
        group: "batch",
        version: "v1",
        plural: "cronjobs",
        namespaced: true,
        aliases: &["cj"],
    },
    KindInfo {
        name: "ingress",
        group: "networking.k8s.io",
        version: "v1",
        plural: "ingresses",
        namespaced: true,
        aliases: &["ing"],
    },
];

/// Find a kind by name, plural or short name (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static KindInfo> {
    let name = name.trim().to_ascii_lowercase();
    KINDS
        .iter()
        .find(|k| k.name == name || k.plural == name || k.aliases.iter().any(|a| *a == name))
}

impl KindInfo {
    /// Collection path for a list/watch call, relative to the API server root.
    pub fn collection_path(&self, namespace: Option<&str>) -> Result<String, WatchError> {
        let prefix = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        match namespace {
            Some(ns) if !self.namespaced => Err(WatchError::Permanent(format!(
                "{} is cluster-scoped and cannot be watched in namespace {}",
                self.name, ns
            ))),
            Some(ns) => Ok(format!("{}/namespaces/{}/{}", prefix, ns, self.plural)),
            None => Ok(format!("{}/{}", prefix, self.plural)),
        }
    }
}
