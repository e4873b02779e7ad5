//! Deployed-instance tracking.
//!
//! Owned by the deployment component and passed by reference to whatever
//! needs lookups. Definitions are keyed by instance name, running stages by
//! deployment id.

use crate::definition::StageDefinition;
use crate::stage::{Stage, StageContext};
use dashmap::DashMap;
use std::sync::Arc;

/// One started stage instance.
pub struct RunningStage {
    pub context: StageContext,
    pub stage: Box<dyn Stage>,
}

/// All instances created by one deploy call.
pub struct Deployed {
    pub deployment_id: String,
    pub definition: Arc<StageDefinition>,
    pub instances: Vec<RunningStage>,
}

/// Summary of a tracked deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRecord {
    pub deployment_id: String,
    pub definition: Arc<StageDefinition>,
}

#[derive(Default)]
pub struct Registry {
    definitions: DashMap<String, DeploymentRecord>,
    deployments: DashMap<String, Deployed>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a deployment. A later deployment under the same instance
    /// name replaces the definition record; its instances stay tracked by id.
    pub fn insert(&self, deployed: Deployed) {
        self.definitions.insert(
            deployed.definition.instance_name.clone(),
            DeploymentRecord {
                deployment_id: deployed.deployment_id.clone(),
                definition: deployed.definition.clone(),
            },
        );
        self.deployments
            .insert(deployed.deployment_id.clone(), deployed);
    }

    /// Removes a deployment and its definition record.
    pub fn take(&self, deployment_id: &str) -> Option<Deployed> {
        let (_, deployed) = self.deployments.remove(deployment_id)?;
        self.definitions.remove_if(&deployed.definition.instance_name, |_, record| {
            record.deployment_id == deployment_id
        });
        Some(deployed)
    }

    pub fn contains(&self, deployment_id: &str) -> bool {
        self.deployments.contains_key(deployment_id)
    }

    /// Definition deployed under `instance_name`.
    pub fn definition(&self, instance_name: &str) -> Option<Arc<StageDefinition>> {
        self.definitions
            .get(instance_name)
            .map(|record| record.definition.clone())
    }

    pub fn record(&self, instance_name: &str) -> Option<DeploymentRecord> {
        self.definitions.get(instance_name).map(|r| r.value().clone())
    }

    /// Every tracked definition, ordered by instance name.
    pub fn records(&self) -> Vec<DeploymentRecord> {
        let mut records: Vec<_> = self.definitions.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.definition.instance_name.cmp(&b.definition.instance_name));
        records
    }

    pub fn deployment_ids(&self) -> Vec<String> {
        self.deployments.iter().map(|d| d.key().clone()).collect()
    }

    pub fn instance_count(&self, deployment_id: &str) -> usize {
        self.deployments
            .get(deployment_id)
            .map_or(0, |d| d.instances.len())
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("definitions", &self.definitions.len())
            .field("deployments", &self.deployments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployed(id: &str, name: &str) -> Deployed {
        Deployed {
            deployment_id: id.to_string(),
            definition: Arc::new(StageDefinition::new("ns", name, "core.Dummy")),
            instances: Vec::new(),
        }
    }

    #[test]
    fn tracks_by_instance_name_and_id() {
        let registry = Registry::new();
        registry.insert(deployed("d1", "A"));
        registry.insert(deployed("d2", "B"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.record("A").unwrap().deployment_id, "d1");
        assert_eq!(
            registry.records().iter().map(|r| r.definition.instance_name.as_str()).collect::<Vec<_>>(),
            vec!["A", "B"]
        );

        assert!(registry.take("d1").is_some());
        assert!(registry.take("d1").is_none());
        assert!(registry.definition("A").is_none());
        assert!(registry.definition("B").is_some());
    }

    #[test]
    fn redeploy_under_same_name_keeps_newest_record() {
        let registry = Registry::new();
        registry.insert(deployed("d1", "A"));
        registry.insert(deployed("d2", "A"));
        assert_eq!(registry.record("A").unwrap().deployment_id, "d2");

        registry.take("d1");
        assert_eq!(registry.record("A").unwrap().deployment_id, "d2");
    }
}
