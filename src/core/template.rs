//! Restricted prompt templating.
//!
//! Stage prompts are rendered with a bare minijinja environment: no
//! includes, no loaders, no stateful filters. Only field lookups on the
//! provided bindings are possible, and missing references render empty so
//! a stage can reference artifacts that do not exist yet.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::{json, Value};

/// One prior stage's output exposed to templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageBinding {
    pub text: String,
    pub hash: String,
}

/// Render a stage prompt with the pipeline input and prior artifacts.
///
/// Bindings (each in capitalized and lowercase spelling):
/// - `input` — the pipeline input string
/// - `artifacts.<stage>.{text,output,hash}` — structured stage outputs
/// - `stages.<stage>.output` — legacy flat form
pub fn render_prompt(
    prompt: &str,
    input: &str,
    artifacts: &BTreeMap<String, StageBinding>,
) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);

    let mut artifact_map = serde_json::Map::new();
    let mut stages_map = serde_json::Map::new();
    for (name, binding) in artifacts {
        artifact_map.insert(
            name.clone(),
            json!({
                "text": binding.text,
                "Text": binding.text,
                "output": binding.text,
                "Output": binding.text,
                "hash": binding.hash,
                "Hash": binding.hash,
            }),
        );
        stages_map.insert(name.clone(), json!({ "output": binding.text }));
    }

    let artifact_value = Value::Object(artifact_map);
    let stages_value = Value::Object(stages_map);
    let context = json!({
        "input": input,
        "Input": input,
        "artifacts": artifact_value.clone(),
        "Artifacts": artifact_value,
        "stages": stages_value.clone(),
        "Stages": stages_value,
    });

    env.render_str(prompt, context).context("render prompt template")
}
