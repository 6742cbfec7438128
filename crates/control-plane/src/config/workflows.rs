// Seed workflow definitions loading
//
// Definitions from the TOML file get deterministic UUIDs (UUID v5 over
// tenant, name and version) so restarts reseed the same ids. The same file
// may carry demo content entities and the risk routing rule.

use anyhow::{Context, Result};
use chrono::Utc;
use conveyor_core::{
    ContentRef, ContentTypeRiskRule, StepSpec, TaskType, Transition, WorkflowDefinition,
    WorkflowGraph,
};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use uuid::Uuid;

/// Namespace UUID for generating deterministic definition IDs
const WORKFLOW_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3f, 0x2c, 0x91, 0x5e, 0x7a, 0x04, 0x4b, 0x8d, 0x9e, 0x61, 0x0c, 0xd2, 0x57, 0xa3, 0x18, 0xe4,
]);

/// Workflow definition as written in the config file
#[derive(Debug, Deserialize)]
pub struct WorkflowConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub content_type: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub initial_state: String,
    pub states: BTreeSet<String>,
    #[serde(default)]
    pub final_states: BTreeSet<String>,
    #[serde(default)]
    pub transitions: BTreeMap<String, Transition>,
    #[serde(default)]
    pub review_tasks: BTreeMap<String, Vec<TaskType>>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

/// Risk routing rule as written in the config file
#[derive(Debug, Deserialize)]
pub struct RiskConfig {
    pub content_types: BTreeSet<String>,
    pub mitigation_state: String,
    #[serde(default)]
    pub min_author_tenure_days: Option<u32>,
}

impl From<RiskConfig> for ContentTypeRiskRule {
    fn from(config: RiskConfig) -> Self {
        let rule = ContentTypeRiskRule::new(config.content_types, config.mitigation_state);
        match config.min_author_tenure_days {
            Some(days) => rule.with_min_author_tenure(days),
            None => rule,
        }
    }
}

/// Root config structure
#[derive(Debug, Deserialize)]
pub struct WorkflowsConfigFile {
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
    #[serde(default)]
    pub content: Vec<ContentRef>,
    #[serde(default)]
    pub risk: Option<RiskConfig>,
}

/// Everything seeded from a workflows file
#[derive(Debug, Default)]
pub struct WorkflowSeed {
    pub definitions: Vec<WorkflowDefinition>,
    pub content: Vec<ContentRef>,
    pub risk: Option<ContentTypeRiskRule>,
}

impl WorkflowConfig {
    fn into_definition(self) -> WorkflowDefinition {
        let id = definition_id(&self.tenant_id, &self.name, self.version);
        WorkflowDefinition {
            id,
            tenant_id: self.tenant_id,
            workspace_id: self.workspace_id,
            name: self.name,
            version: self.version,
            content_type: self.content_type,
            active: self.active,
            graph: WorkflowGraph {
                states: self.states,
                transitions: self.transitions,
                initial_state: self.initial_state,
                final_states: self.final_states,
                review_tasks: self.review_tasks,
            },
            steps: self.steps,
            created_at: Utc::now(),
        }
    }
}

/// Deterministic id of a seeded definition
pub fn definition_id(tenant_id: &str, name: &str, version: u32) -> Uuid {
    Uuid::new_v5(
        &WORKFLOW_NAMESPACE,
        format!("{}/{}/{}", tenant_id, name, version).as_bytes(),
    )
}

/// Load and validate seed definitions from a TOML file
pub fn load_workflows_config(path: &Path) -> Result<WorkflowSeed> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflows config: {}", path.display()))?;
    parse_workflows_config(&content)
        .with_context(|| format!("Failed to parse workflows config: {}", path.display()))
}

fn parse_workflows_config(content: &str) -> Result<WorkflowSeed> {
    let file: WorkflowsConfigFile = toml::from_str(content)?;
    let definitions = file
        .workflows
        .into_iter()
        .map(|config| {
            let definition = config.into_definition();
            definition
                .validate()
                .with_context(|| format!("workflow '{}' is invalid", definition.name))?;
            Ok(definition)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(WorkflowSeed {
        definitions,
        content: file.content,
        risk: file.risk.map(Into::into),
    })
}
