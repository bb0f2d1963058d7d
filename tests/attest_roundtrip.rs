//! Attestation build/verify round trips over real evidence bundles.

use std::fs;
use std::path::{Path, PathBuf};

use flowgate::attest::verify::{verify_attestation, verify_attestation_file, VerifyError};
use flowgate::attest::{build_attestation, write_attestation, SCHEMA_V0};
use flowgate::io::backend::{BackendRegistry, MockBackend, ScriptedResponse};
use flowgate::io::manifest::{GateDefinition, Pipeline, Stage};
use flowgate::pipeline::{run, RunOptions};

/// Run a single-stage pipeline with a passing shell gate and return the
/// evidence directory.
fn passing_run(workspace: &Path) -> PathBuf {
    let pipeline = Pipeline {
        name: "attested".to_string(),
        defaults: flowgate::io::manifest::Defaults {
            backend: Some("mock".to_string()),
            model: Some("mock-sonnet".to_string()),
        },
        gates: [(
            "check".to_string(),
            GateDefinition::Command {
                command: vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
                workdir: None,
                deny_shell: Some(false),
                allowed_commands: Vec::new(),
                capability: None,
                templates: Vec::new(),
            },
        )]
        .into_iter()
        .collect(),
        stages: vec![Stage {
            name: "build".to_string(),
            prompt: "produce output for {{ input }}".to_string(),
            gates: vec!["check".to_string()],
            max_retries: 1,
            ..Stage::default()
        }],
        ..Pipeline::default()
    };

    let mut backends = BackendRegistry::new();
    backends.insert(
        "mock".to_string(),
        Box::new(MockBackend::new(
            "mock",
            vec![ScriptedResponse::Content("artifact body".to_string())],
        )),
    );

    let opts = RunOptions {
        input: "demo".to_string(),
        workspace_path: Some(workspace.to_path_buf()),
        pipeline_path: "pipeline.yaml".to_string(),
        apply_approved: true,
        ..RunOptions::default()
    };

    run(&pipeline, &backends, &opts).expect("run").evidence_dir
}

#[test]
fn build_then_verify_round_trips() {
    let temp = tempfile::tempdir().expect("tempdir");
    let evidence = passing_run(temp.path());

    let attestation = build_attestation(&evidence, "build").expect("build attestation");
    assert_eq!(attestation.schema, SCHEMA_V0);
    assert_eq!(attestation.subject.stage, "build");
    assert!(attestation.claim.passed);
    assert!(attestation.claim.gated);
    assert_eq!(attestation.claim.gate_count, 1);
    assert_eq!(attestation.claim.gates[0].name, "check");

    // run.json, stage json, prompt/output + attempt blobs, gate log.
    assert!(attestation.hashes.len() >= 5);
    assert!(attestation.hashes.contains_key("run.json"));
    assert!(attestation.hashes.contains_key("stages/build.json"));
    assert!(attestation
        .evidence
        .gate_logs
        .iter()
        .any(|log| log == "gates/build-check.log"));
    for path in attestation.evidence.blobs.iter() {
        assert!(attestation.hashes.contains_key(path), "{path} unhashed");
    }

    verify_attestation(&attestation, &evidence).expect("verify");
}

#[test]
fn verify_round_trips_through_a_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let evidence = passing_run(temp.path());

    let attestation = build_attestation(&evidence, "build").expect("build attestation");
    let attestation_path = temp.path().join("attestation.json");
    write_attestation(&attestation_path, &attestation).expect("write");

    verify_attestation_file(&attestation_path, &evidence).expect("verify file");
}

#[test]
fn single_byte_tamper_fails_with_hash_mismatch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let evidence = passing_run(temp.path());
    let attestation = build_attestation(&evidence, "build").expect("build attestation");

    let run_json = evidence.join("run.json");
    let mut raw = fs::read(&run_json).expect("read run.json");
    let index = raw.len() / 2;
    raw[index] = raw[index].wrapping_add(1);
    fs::write(&run_json, raw).expect("tamper");

    let err = verify_attestation(&attestation, &evidence).expect_err("tampered");
    assert!(matches!(
        err.downcast_ref::<VerifyError>(),
        Some(VerifyError::HashMismatch(path)) if path == "run.json"
    ));
}

#[test]
fn deleted_evidence_fails_as_missing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let evidence = passing_run(temp.path());
    let attestation = build_attestation(&evidence, "build").expect("build attestation");

    fs::remove_file(evidence.join("gates/build-check.log")).expect("delete");

    let err = verify_attestation(&attestation, &evidence).expect_err("missing");
    assert!(matches!(
        err.downcast_ref::<VerifyError>(),
        Some(VerifyError::MissingEvidence(_))
    ));
}

#[test]
fn tampered_claim_fails_even_with_valid_hashes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let evidence = passing_run(temp.path());
    let mut attestation = build_attestation(&evidence, "build").expect("build attestation");

    attestation.claim.gates[0].score = 42;

    let err = verify_attestation(&attestation, &evidence).expect_err("claim tampered");
    assert!(matches!(
        err.downcast_ref::<VerifyError>(),
        Some(VerifyError::ClaimMismatch(_))
    ));
}

#[test]
fn unknown_schema_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let evidence = passing_run(temp.path());
    let mut attestation = build_attestation(&evidence, "build").expect("build attestation");

    attestation.schema = "flowgate.attestation.v9".to_string();

    let err = verify_attestation(&attestation, &evidence).expect_err("unknown schema");
    assert!(matches!(
        err.downcast_ref::<VerifyError>(),
        Some(VerifyError::UnknownSchema(_))
    ));
}

#[test]
fn traversal_in_hash_paths_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let evidence = passing_run(temp.path());
    let mut attestation = build_attestation(&evidence, "build").expect("build attestation");

    attestation
        .hashes
        .insert("../outside.txt".to_string(), "00".repeat(32));

    assert!(verify_attestation(&attestation, &evidence).is_err());
}

#[test]
fn attesting_missing_stage_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let evidence = passing_run(temp.path());
    assert!(build_attestation(&evidence, "nope").is_err());
}
