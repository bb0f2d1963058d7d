//! Pipeline manifest loading and validation.
//!
//! Manifests are YAML; unknown fields are ignored. Validation checks the
//! stage graph and gate references only — prompt templates are checked at
//! render time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::cost::PricingTable;
use crate::core::policy::CommandTemplate;

/// Gate name that always resolves to the external checker, defined or not.
pub const RESERVED_EXTERNAL_GATE: &str = "hollowcheck";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("pipeline name is required")]
    MissingName,
    #[error("pipeline must define at least one stage")]
    NoStages,
    #[error("stage name is required")]
    EmptyStageName,
    #[error("stage {0} must have a prompt")]
    EmptyPrompt(String),
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),
    #[error("stage {stage} has empty gate name")]
    EmptyGateName { stage: String },
    #[error("stage {stage} references unknown gate {gate}")]
    UnknownGate { stage: String, gate: String },
    #[error("gate {0} requires a non-empty command")]
    EmptyCommand(String),
}

/// A multi-stage gated pipeline definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gates: BTreeMap<String, GateDefinition>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub max_budget_usd: f64,
    #[serde(default, skip_serializing_if = "PricingTable::is_empty")]
    pub pricing: PricingTable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One step of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub apply: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
}

/// A named quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateDefinition {
    Command {
        #[serde(default)]
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<PathBuf>,
        /// Defaults to true when omitted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deny_shell: Option<bool>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        allowed_commands: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capability: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        templates: Vec<CommandTemplate>,
    },
    ExternalCheck {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        binary_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contract_path: Option<PathBuf>,
    },
}

/// Read a pipeline definition from a YAML file.
pub fn load_manifest(path: &Path) -> Result<Pipeline> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    let pipeline: Pipeline = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse manifest {}", path.display()))?;
    Ok(pipeline)
}

impl Pipeline {
    /// Check the stage graph and gate references.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.is_empty() {
            return Err(ManifestError::MissingName);
        }
        if self.stages.is_empty() {
            return Err(ManifestError::NoStages);
        }

        for (name, def) in &self.gates {
            if let GateDefinition::Command { command, .. } = def {
                if command.is_empty() {
                    return Err(ManifestError::EmptyCommand(name.clone()));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(ManifestError::EmptyStageName);
            }
            if stage.prompt.is_empty() {
                return Err(ManifestError::EmptyPrompt(stage.name.clone()));
            }
            if !seen.insert(stage.name.clone()) {
                return Err(ManifestError::DuplicateStage(stage.name.clone()));
            }

            for gate in &stage.gates {
                if gate.is_empty() {
                    return Err(ManifestError::EmptyGateName {
                        stage: stage.name.clone(),
                    });
                }
                if !self.gates.contains_key(gate) && gate != RESERVED_EXTERNAL_GATE {
                    return Err(ManifestError::UnknownGate {
                        stage: stage.name.clone(),
                        gate: gate.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
