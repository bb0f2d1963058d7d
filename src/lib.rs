//! Gated multi-stage LLM pipeline engine.
//!
//! Executes declarative pipelines that send prompts to model backends,
//! enforces output quality through command and external-check gates,
//! applies produced artifacts under a dry-run-by-default sandbox, and
//! writes a content-addressed evidence trail with attestations on top.

pub mod attest;
pub mod core;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod stage;
