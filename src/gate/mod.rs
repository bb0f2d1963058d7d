//! Gate construction and evaluation.
//!
//! Gates are tagged variants (command / external check) so the policy
//! logic stays pure and testable. Construction resolves the command
//! policy mode in priority order: capability, inline templates, legacy
//! exact commands.

pub mod command;
pub mod external;

use std::path::Path;

use anyhow::{bail, Result};

use crate::core::artifact::Artifact;
use crate::core::cancel::CancelToken;
use crate::core::policy::{
    templates_for_capability, templates_from_exact, CommandPolicy, PolicyMode,
};
use crate::core::types::GateResult;
use crate::io::manifest::{GateDefinition, Pipeline, RESERVED_EXTERNAL_GATE};

use command::CommandGate;
use external::ExternalCheckGate;

/// A constructed, evaluatable gate.
#[derive(Debug)]
pub enum Gate {
    Command(CommandGate),
    External { name: String, gate: ExternalCheckGate },
}

impl Gate {
    pub fn name(&self) -> &str {
        match self {
            Gate::Command(gate) => gate.name(),
            Gate::External { name, .. } => name,
        }
    }

    pub fn evaluate(&self, token: &CancelToken, artifact: &Artifact) -> Result<GateResult> {
        match self {
            Gate::Command(gate) => gate.evaluate(token),
            Gate::External { gate, .. } => gate.evaluate(token, artifact),
        }
    }
}

/// Build gate instances for a stage's ordered gate list.
///
/// `workspace_root` is the directory gates observe (the temp clone during
/// dry-run applies). Unknown capabilities are fatal here, before any side
/// effect.
pub fn build_gates(
    pipeline: &Pipeline,
    gate_names: &[String],
    workspace_root: &Path,
    shell_approved: bool,
) -> Result<Vec<Gate>> {
    let mut gates = Vec::with_capacity(gate_names.len());

    for name in gate_names {
        if name == RESERVED_EXTERNAL_GATE && !pipeline.gates.contains_key(name) {
            gates.push(Gate::External {
                name: name.clone(),
                gate: ExternalCheckGate::new("", None),
            });
            continue;
        }

        let Some(def) = pipeline.gates.get(name) else {
            bail!("gate {name} not defined");
        };

        match def {
            GateDefinition::ExternalCheck {
                binary_path,
                contract_path,
            } => {
                gates.push(Gate::External {
                    name: name.clone(),
                    gate: ExternalCheckGate::new(binary_path, contract_path.clone()),
                });
            }
            GateDefinition::Command {
                command,
                workdir,
                deny_shell,
                allowed_commands,
                capability,
                templates,
            } => {
                let resolved_workdir = workdir.as_ref().map(|dir| {
                    if dir.is_absolute() {
                        dir.clone()
                    } else {
                        workspace_root.join(dir)
                    }
                });

                let (mode, capability, templates) = if let Some(capability) = capability {
                    (
                        PolicyMode::Capability,
                        Some(capability.clone()),
                        templates_for_capability(capability)?,
                    )
                } else if !templates.is_empty() {
                    (PolicyMode::Templates, None, templates.clone())
                } else if !allowed_commands.is_empty() {
                    (PolicyMode::Legacy, None, templates_from_exact(allowed_commands))
                } else {
                    (PolicyMode::None, None, Vec::new())
                };

                let policy = CommandPolicy {
                    mode,
                    capability,
                    templates,
                    deny_shell: deny_shell.unwrap_or(true),
                    shell_approved,
                    workspace_root: workspace_root.to_path_buf(),
                    workdir: resolved_workdir,
                };
                gates.push(Gate::Command(CommandGate::new(name, command.clone(), policy)?));
            }
        }
    }

    Ok(gates)
}
