//! Cluster file: the endpoints to register plus optional policy overrides.
//!
//! ```yaml
//! clusters:
//!   - name: prod
//!     url: https://10.0.0.1:6443
//!     context: prod-admin
//! policy:
//!   max_replicas: 30
//!   refresh_kinds: [pods, deployments]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use cabin_core::{NewCluster, Policy};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterFile {
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,
    #[serde(default)]
    pub policy: PolicyOverrides,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterEntry {
    #[serde(default)]
    pub name: String,
    pub url: String,
    /// Kubeconfig context holding the credentials.
    #[serde(default)]
    pub context: Option<String>,
}

impl ClusterEntry {
    pub fn to_request(&self) -> NewCluster {
        NewCluster { name: self.name.clone(), url: self.url.clone(), credentials_ref: self.context.clone() }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverrides {
    pub health_interval_secs: Option<u64>,
    pub refresh_interval_secs: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub max_replicas: Option<u32>,
    pub mutation_timeout_secs: Option<u64>,
    pub scale_followup_ms: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub refresh_kinds: Option<Vec<String>>,
    pub list_page_size: Option<u32>,
}

impl PolicyOverrides {
    /// Same keys as the `CABIN_*` environment overlay, so both go through one parser.
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "CABIN_HEALTH_INTERVAL_SECS" => self.health_interval_secs.map(|v| v.to_string()),
            "CABIN_REFRESH_INTERVAL_SECS" => self.refresh_interval_secs.map(|v| v.to_string()),
            "CABIN_FAILURE_THRESHOLD" => self.failure_threshold.map(|v| v.to_string()),
            "CABIN_MAX_REPLICAS" => self.max_replicas.map(|v| v.to_string()),
            "CABIN_MUTATION_TIMEOUT_SECS" => self.mutation_timeout_secs.map(|v| v.to_string()),
            "CABIN_SCALE_FOLLOWUP_MS" => self.scale_followup_ms.map(|v| v.to_string()),
            "CABIN_PROBE_TIMEOUT_SECS" => self.probe_timeout_secs.map(|v| v.to_string()),
            "CABIN_REFRESH_KINDS" => self.refresh_kinds.as_ref().map(|v| v.join(",")),
            "CABIN_LIST_PAGE_SIZE" => self.list_page_size.map(|v| v.to_string()),
            _ => None,
        }
    }
}

impl ClusterFile {
    pub fn parse(text: &str) -> Result<Self> { serde_yaml::from_str(text).context("parsing cluster file") }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Defaults, then the file's `policy:` section, then `CABIN_*` variables.
    pub fn policy(&self, env: impl Fn(&str) -> Option<String>) -> Policy {
        Policy::default().overlay(|k| self.policy.lookup(k)).overlay(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabin_core::EntityKind;
    use std::time::Duration;

    const SAMPLE: &str = r#"
clusters:
  - name: prod
    url: https://10.0.0.1:6443
    context: prod-admin
  - url: https://staging.example:6443
policy:
  max_replicas: 30
  health_interval_secs: 5
  refresh_kinds: [pods, svc]
"#;

    #[test]
    fn parses_clusters_and_policy() {
        let f = ClusterFile::parse(SAMPLE).unwrap();
        assert_eq!(f.clusters.len(), 2);
        let req = f.clusters[0].to_request();
        assert_eq!(req.name, "prod");
        assert_eq!(req.credentials_ref.as_deref(), Some("prod-admin"));
        assert!(f.clusters[1].name.is_empty());

        let p = f.policy(|_| None);
        assert_eq!(p.max_replicas, 30);
        assert_eq!(p.health_interval, Duration::from_secs(5));
        assert_eq!(p.refresh_kinds, vec![EntityKind::Pod, EntityKind::Service]);
        assert_eq!(p.failure_threshold, Policy::default().failure_threshold);
    }

    #[test]
    fn environment_wins_over_file() {
        let f = ClusterFile::parse(SAMPLE).unwrap();
        let p = f.policy(|k| (k == "CABIN_MAX_REPLICAS").then(|| "12".to_string()));
        assert_eq!(p.max_replicas, 12);
        assert_eq!(p.health_interval, Duration::from_secs(5));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(ClusterFile::parse("clusters: []\nclustrs: []\n").is_err());
        assert!(ClusterFile::parse("policy:\n  max_replica: 3\n").is_err());
        assert!(ClusterFile::parse("clusters:\n  - name: x\n").is_err());
    }
}
