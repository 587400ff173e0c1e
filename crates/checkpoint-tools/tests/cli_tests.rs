//! CLI tests for the checkpoint-tools binary.

use assert_cmd::Command;
use checkpoint_tools::{load_state_dict, save_state_dict, StateDict, Tensor};
use checkpoint_core::DType;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Get a Command for the checkpoint-tools binary.
fn cmd() -> Command {
    Command::cargo_bin("checkpoint-tools").unwrap()
}

fn weight(shape: &[usize]) -> Tensor {
    let numel: usize = shape.iter().product();
    let values: Vec<f32> = (0..numel).map(|i| ((i as f32) * 0.37).sin() * 0.1).collect();
    Tensor::from_f32(shape.to_vec(), &values)
}

/// Write a shrunken SD1.5-shaped checkpoint into `dir`.
fn write_sd15_checkpoint(dir: &Path) -> std::path::PathBuf {
    let mut dict = StateDict::new();
    dict.insert(
        "cond_stage_model.transformer.text_model.embeddings.token_embedding.weight",
        weight(&[32, 8]),
    );
    dict.insert("model.diffusion_model.input_blocks.0.0.weight", weight(&[8, 8]));
    dict.insert("first_stage_model.encoder.conv_in.weight", weight(&[8, 3, 3, 3]));
    let path = dir.join("model.safetensors");
    save_state_dict(&dict, &path).unwrap();
    path
}

// ============================================================================
// Help and Version Tests
// ============================================================================

#[test]
fn test_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Convert, combine, and re-key neural network checkpoints",
        ));
}

#[test]
fn test_version() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("checkpoint-tools"));
}

#[test]
fn test_convert_help() {
    cmd()
        .args(["convert", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--precision"))
        .stdout(predicate::str::contains("--replace-key"));
}

#[test]
fn test_no_subcommand() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_convert_missing_input() {
    cmd()
        .args(["convert"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("INPUT"));
}

#[test]
fn test_bad_replace_rule() {
    cmd()
        .args(["convert", "model.safetensors", "--replace-key", "no-colon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("OLD:NEW"));
}

#[test]
fn test_completions() {
    cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("checkpoint-tools"));
}

// ============================================================================
// Command Tests
// ============================================================================

#[test]
fn test_metadata_lists_tensors_and_total() {
    let temp = TempDir::new().unwrap();
    let input = write_sd15_checkpoint(temp.path());

    // 256 + 64 + 216 = 536 parameters
    cmd()
        .args(["metadata", input.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "model.diffusion_model.input_blocks.0.0.weight: [8, 8] F32",
        ))
        .stdout(predicate::str::contains("Total parameters: 536 (536)"));
}

#[test]
fn test_metadata_abbreviates_total() {
    let temp = TempDir::new().unwrap();
    let mut dict = StateDict::new();
    dict.insert("big.weight", weight(&[1000, 1000]));
    dict.insert("small.bias", weight(&[500]));
    let input = temp.path().join("model.safetensors");
    save_state_dict(&dict, &input).unwrap();

    cmd()
        .args(["metadata", input.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total parameters: 1.0M (1,000,500)"));
}

#[test]
fn test_convert_writes_named_output() {
    let temp = TempDir::new().unwrap();
    let input = write_sd15_checkpoint(temp.path());

    cmd()
        .args([
            "convert",
            input.to_str().unwrap(),
            "--name",
            "converted",
            "--precision",
            "float16",
        ])
        .assert()
        .success();

    let output = temp.path().join("converted.safetensors");
    let dict = load_state_dict(&output).unwrap();
    assert_eq!(
        dict.get("model.diffusion_model.input_blocks.0.0.weight")
            .unwrap()
            .dtype,
        DType::Float16
    );
}

#[test]
fn test_convert_refuses_existing_output() {
    let temp = TempDir::new().unwrap();
    let input = write_sd15_checkpoint(temp.path());

    let args = ["convert", input.to_str().unwrap(), "--name", "out"];
    cmd().args(args).assert().success();
    cmd()
        .args(args)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    // --overwrite replaces it
    cmd().args(args).arg("--overwrite").assert().success();
}

#[test]
fn test_convert_applies_key_rules() {
    let temp = TempDir::new().unwrap();
    let input = write_sd15_checkpoint(temp.path());

    cmd()
        .args([
            "convert",
            input.to_str().unwrap(),
            "--name",
            "rekeyed",
            "--ignore-key",
            "first_stage_model",
            "--replace-key",
            "cond_stage_model.transformer.:te.",
        ])
        .assert()
        .success();

    let dict = load_state_dict(&temp.path().join("rekeyed.safetensors")).unwrap();
    assert!(dict.contains_key("te.text_model.embeddings.token_embedding.weight"));
    assert!(!dict.keys().any(|k| k.contains("first_stage_model")));
}

#[test]
fn test_convert_to_diffusers_writes_components() {
    let temp = TempDir::new().unwrap();
    let input = write_sd15_checkpoint(temp.path());

    cmd()
        .args([
            "convert-to-diffusers",
            input.to_str().unwrap(),
            "--name",
            "split",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("sd15"));

    for component in ["text_encoder", "unet", "vae"] {
        let path = temp.path().join(format!("split-{component}.safetensors"));
        assert!(path.exists(), "missing {component} output");
    }
}

#[test]
fn test_convert_to_diffusers_rejects_wrong_hint() {
    let temp = TempDir::new().unwrap();
    let input = write_sd15_checkpoint(temp.path());

    cmd()
        .args([
            "convert-to-diffusers",
            input.to_str().unwrap(),
            "--model-type",
            "flux-dev",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("flux-dev"));
}

#[test]
fn test_combine_later_file_wins() {
    let temp = TempDir::new().unwrap();
    let a_path = temp.path().join("a.safetensors");
    let b_path = temp.path().join("b.safetensors");

    let mut a = StateDict::new();
    a.insert("shared.weight", Tensor::from_f32(vec![2], &[1.0, 1.0]));
    save_state_dict(&a, &a_path).unwrap();

    let mut b = StateDict::new();
    b.insert("shared.weight", Tensor::from_f32(vec![2], &[9.0, 9.0]));
    b.insert("extra.weight", Tensor::from_f32(vec![2], &[3.0, 3.0]));
    save_state_dict(&b, &b_path).unwrap();

    cmd()
        .args([
            "combine",
            a_path.to_str().unwrap(),
            b_path.to_str().unwrap(),
            "--name",
            "merged",
        ])
        .assert()
        .success();

    let merged = load_state_dict(&temp.path().join("merged.safetensors")).unwrap();
    assert_eq!(merged.len(), 2);
    assert_eq!(
        merged.get("shared.weight").unwrap().data,
        Tensor::from_f32(vec![2], &[9.0, 9.0]).data
    );

    // reversed argument order flips the winner
    cmd()
        .args([
            "combine",
            b_path.to_str().unwrap(),
            a_path.to_str().unwrap(),
            "--name",
            "merged-reversed",
        ])
        .assert()
        .success();

    let reversed = load_state_dict(&temp.path().join("merged-reversed.safetensors")).unwrap();
    assert_eq!(reversed.len(), 2);
    assert_eq!(
        reversed.get("shared.weight").unwrap().data,
        Tensor::from_f32(vec![2], &[1.0, 1.0]).data
    );
}

#[test]
fn test_missing_input_file_reports_error() {
    cmd()
        .args(["metadata", "/nonexistent/model.safetensors"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}
