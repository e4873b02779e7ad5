//! Stage definitions: the declarative topology documents.
//!
//! A [`StageDefinition`] is parsed once (YAML or JSON, after the template
//! pre-pass) and is immutable afterwards. Equality is structural over every
//! field.
//!
//! ```yaml
//! namespace: core
//! instanceName: EventLogSink_01
//! type: core.EventLogSink
//! deploymentType: LOCAL
//! inputLanes:
//!   - type: EVENT
//!     name: in_log
//! options:
//!   - section: main
//!     verbose: true
//! ```

use crate::error::{RelayError, Result};
use crate::options::{OptionRow, StageOptions};
use crate::template;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Where a stage instance gets created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentType {
    /// In this process.
    #[default]
    Local,
    /// On one peer listening on the deploy address.
    Single,
    /// On every peer listening on the deploy address.
    Global,
}

/// Kind of a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IoLaneType {
    /// Fire-and-forget events, broadcast unless `p2p`.
    #[default]
    Event,
    /// Request/reply with a single responder.
    Interactive,
    /// Reserved for bulk transfer.
    Data,
}

/// A lane declared on a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoLane {
    pub name: String,
    #[serde(rename = "type", default)]
    pub lane_type: IoLaneType,
    #[serde(default)]
    pub p2p: bool,
}

impl IoLane {
    pub fn new(name: impl Into<String>, lane_type: IoLaneType) -> Self {
        Self {
            name: name.into(),
            lane_type,
            p2p: false,
        }
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self::new(name, IoLaneType::Event)
    }

    pub fn interactive(name: impl Into<String>) -> Self {
        Self::new(name, IoLaneType::Interactive)
    }

    #[must_use]
    pub fn p2p(mut self) -> Self {
        self.p2p = true;
        self
    }
}

impl fmt::Display for IoLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?}{})", self.name, self.lane_type, if self.p2p { ", p2p" } else { "" })
    }
}

/// Placement constraint: attribute name to required value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentConstraint(pub BTreeMap<String, String>);

/// Declarative description of one deployable stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StageDefinition {
    pub namespace: String,
    pub instance_name: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    pub deployment_type: DeploymentType,
    pub worker: bool,
    pub high_availability: bool,
    pub instances: usize,
    pub input_lanes: Vec<IoLane>,
    pub output_lanes: Vec<IoLane>,
    pub environment: BTreeMap<String, String>,
    pub options: Vec<OptionRow>,
    pub agents: Vec<AgentConstraint>,
}

impl Default for StageDefinition {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            instance_name: "NO_NAME".to_string(),
            stage_type: "NO_TYPE".to_string(),
            deployment_type: DeploymentType::Local,
            worker: false,
            high_availability: false,
            instances: 1,
            input_lanes: Vec::new(),
            output_lanes: Vec::new(),
            environment: BTreeMap::new(),
            options: Vec::new(),
            agents: Vec::new(),
        }
    }
}

impl StageDefinition {
    /// Minimal definition with the given identity.
    pub fn new(
        namespace: impl Into<String>,
        instance_name: impl Into<String>,
        stage_type: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            instance_name: instance_name.into(),
            stage_type: stage_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_input_lane(mut self, lane: IoLane) -> Self {
        self.input_lanes.push(lane);
        self
    }

    #[must_use]
    pub fn with_output_lane(mut self, lane: IoLane) -> Self {
        self.output_lanes.push(lane);
        self
    }

    #[must_use]
    pub fn with_option_row(mut self, row: OptionRow) -> Self {
        self.options.push(row);
        self
    }

    #[must_use]
    pub fn with_deployment_type(mut self, deployment_type: DeploymentType) -> Self {
        self.deployment_type = deployment_type;
        self
    }

    #[must_use]
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    /// Parses a YAML document without the template pre-pass.
    pub fn from_yaml(name: &str, yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RelayError::yaml(name, e))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Renders `body` against the process `config`, then parses it as YAML.
    pub fn from_template(name: &str, body: &str, config: &serde_json::Value) -> Result<Self> {
        let rendered = template::render(name, body, config)?;
        debug!(document = %name, "parsing stage definition");
        Self::from_yaml(name, &rendered)
    }

    /// Reads and parses a document from disk.
    pub fn from_file(path: &Path, config: &serde_json::Value) -> Result<Self> {
        let body = std::fs::read_to_string(path).map_err(|e| RelayError::io(path, e))?;
        Self::from_template(&path.display().to_string(), &body, config)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Options grouped into sections.
    ///
    /// # Errors
    ///
    /// [`RelayError::AmbiguousSection`] when a row names two sections.
    pub fn opts(&self) -> Result<StageOptions> {
        StageOptions::new(&self.options)
    }

    pub fn input_lane(&self, name: &str) -> Option<&IoLane> {
        find_lane(&self.input_lanes, name)
    }

    pub fn output_lane(&self, name: &str) -> Option<&IoLane> {
        find_lane(&self.output_lanes, name)
    }

    /// Checks that lane names are unique per direction.
    pub fn validate(&self) -> Result<()> {
        for (direction, lanes) in [("input", &self.input_lanes), ("output", &self.output_lanes)] {
            for (i, lane) in lanes.iter().enumerate() {
                if lanes[..i].iter().any(|other| other.name.eq_ignore_ascii_case(&lane.name)) {
                    return Err(RelayError::config(format!(
                        "duplicate {direction} lane '{}' on {}",
                        lane.name, self.instance_name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn find_lane<'a>(lanes: &'a [IoLane], name: &str) -> Option<&'a IoLane> {
    lanes.iter().find(|lane| lane.name.eq_ignore_ascii_case(name))
}

impl fmt::Display for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({}, {:?})",
            self.namespace, self.instance_name, self.stage_type, self.deployment_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOG_SINK: &str = r#"
---
namespace: "core"
instanceName: "EventLogSink_01"
type: "core.EventLogSink"
inputLanes:
  - type: EVENT
    name: "in_new_definition"
  - type: EVENT
    name: out_shell
  - type: INTERACTIVE
    name: in_get_definition
    p2p: true
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let def = StageDefinition::from_yaml("sink", LOG_SINK).unwrap();
        assert_eq!(def.namespace, "core");
        assert_eq!(def.instance_name, "EventLogSink_01");
        assert_eq!(def.stage_type, "core.EventLogSink");
        assert_eq!(def.deployment_type, DeploymentType::Local);
        assert_eq!(def.instances, 1);
        assert!(!def.worker);
        assert_eq!(def.input_lanes.len(), 3);
        assert_eq!(def.input_lanes[2].lane_type, IoLaneType::Interactive);
        assert!(def.input_lanes[2].p2p);
        assert!(!def.input_lanes[0].p2p);
    }

    #[test]
    fn empty_document_fields_fall_back() {
        let def = StageDefinition::from_yaml("empty", "{}").unwrap();
        assert_eq!(def, StageDefinition::default());
        assert_eq!(def.instance_name, "NO_NAME");
        assert_eq!(def.stage_type, "NO_TYPE");
    }

    #[test]
    fn template_pre_pass_reads_config() {
        let body = "namespace: {{ config.ns }}\ninstanceName: A\ntype: core.Dummy\ndeploymentType: GLOBAL\n";
        let def = StageDefinition::from_template("a.yml", body, &json!({"ns": "shop"})).unwrap();
        assert_eq!(def.namespace, "shop");
        assert_eq!(def.deployment_type, DeploymentType::Global);
    }

    #[test]
    fn structural_equality_and_json_round_trip() {
        let def = StageDefinition::new("ns", "A", "core.Dummy")
            .with_output_lane(IoLane::event("out").p2p())
            .with_option_row(json!({"section": "main", "x": 1}).as_object().cloned().unwrap());
        let back = StageDefinition::from_json_value(def.to_json().unwrap()).unwrap();
        assert_eq!(back, def);
        assert_ne!(back, StageDefinition::new("ns", "A", "core.Dummy"));
    }

    #[test]
    fn lanes_are_looked_up_case_insensitively() {
        let def = StageDefinition::from_yaml("sink", LOG_SINK).unwrap();
        assert!(def.input_lane("OUT_SHELL").is_some());
        assert!(def.output_lane("out_shell").is_none());
    }

    #[test]
    fn duplicate_lane_names_fail_validation() {
        let def = StageDefinition::new("ns", "A", "t")
            .with_input_lane(IoLane::event("in"))
            .with_input_lane(IoLane::event("IN"));
        assert!(def.validate().is_err());
        let ok = StageDefinition::new("ns", "A", "t")
            .with_input_lane(IoLane::event("in"))
            .with_output_lane(IoLane::event("in"));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn bad_yaml_names_the_document() {
        let err = StageDefinition::from_yaml("broken.yml", "inputLanes: [").unwrap_err();
        assert!(err.to_string().contains("broken.yml"));
    }
}
