//! Integration tests for checkpoint-tools.
//!
//! Exercises the whole pipeline end to end: write, reload, rekey, cast,
//! split, quantize.

use checkpoint_tools::{
    cast_state_dict, classify_and_split, extension_for_state_dict, load_state_dict,
    quantize_for_model, save_state_dict, Architecture, Precision, QuantKind, StateDict, Tensor,
};
use checkpoint_core::DType;
use tempfile::TempDir;

fn weight(shape: &[usize]) -> Tensor {
    let numel: usize = shape.iter().product();
    let values: Vec<f32> = (0..numel).map(|i| ((i as f32) * 0.37).sin() * 0.1).collect();
    Tensor::from_f32(shape.to_vec(), &values)
}

/// A small state dict with the key layout of an SD1.5 single-file
/// checkpoint. Tensor shapes are shrunk; only the attention weight is
/// large enough to be quantizable.
fn synthetic_sd15() -> StateDict {
    let mut dict = StateDict::new();
    dict.insert(
        "cond_stage_model.transformer.text_model.embeddings.token_embedding.weight",
        weight(&[32, 8]),
    );
    dict.insert("model.diffusion_model.input_blocks.0.0.weight", weight(&[8, 8]));
    dict.insert(
        "model.diffusion_model.middle_block.1.proj_in.weight",
        weight(&[64, 64]),
    );
    dict.insert("model.diffusion_model.out.2.bias", weight(&[8]));
    dict.insert("first_stage_model.encoder.conv_in.weight", weight(&[8, 3, 3, 3]));
    dict.insert("alphas_cumprod", weight(&[100]));
    dict
}

#[test]
fn test_write_reload_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.safetensors");

    let dict = synthetic_sd15();
    let expected: Vec<(String, Vec<usize>, DType)> = dict
        .iter()
        .map(|(k, t)| (k.to_string(), t.shape.clone(), t.dtype))
        .collect();

    save_state_dict(&dict, &path).unwrap();
    let reloaded = load_state_dict(&path).unwrap();

    let actual: Vec<(String, Vec<usize>, DType)> = reloaded
        .iter()
        .map(|(k, t)| (k.to_string(), t.shape.clone(), t.dtype))
        .collect();
    assert_eq!(actual, expected);

    for (key, tensor) in dict.iter() {
        assert_eq!(reloaded.get(key).unwrap().data, tensor.data, "data for {key}");
    }
}

#[test]
fn test_rekey_and_cast_through_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.safetensors");
    save_state_dict(&synthetic_sd15(), &path).unwrap();

    let dict = load_state_dict(&path).unwrap();
    let mut dict = dict
        .filtered_renamed(
            &["alphas_cumprod".to_string()],
            &[("first_stage_model.".to_string(), "vae.".to_string())],
        )
        .unwrap();
    cast_state_dict(&mut dict, Precision::Float16).unwrap();

    assert!(!dict.contains_key("alphas_cumprod"));
    let vae = dict.get("vae.encoder.conv_in.weight").unwrap();
    assert_eq!(vae.dtype, DType::Float16);
    assert_eq!(vae.shape, vec![8, 3, 3, 3]);
}

#[test]
fn test_split_and_quantize_pipeline() {
    let tmp = TempDir::new().unwrap();

    let (arch, components) = classify_and_split(synthetic_sd15(), None).unwrap();
    assert_eq!(arch, Architecture::Sd15);
    let names: Vec<&str> = components.iter().map(|(n, _)| *n).collect();
    assert_eq!(names, vec!["text_encoder", "unet", "vae"]);

    for (component, sub) in components {
        let sub = quantize_for_model(sub, arch, component, QuantKind::Nf4).unwrap();
        let ext = extension_for_state_dict(&sub);
        if component == "unet" {
            // the 64x64 projection is the only eligible tensor
            assert_eq!(ext, ".bnb.safetensors");
            assert!(sub.contains_key("middle_block.1.proj_in.weight.quant_state"));
        } else {
            assert_eq!(ext, ".safetensors");
        }

        let path = tmp.path().join(format!("model-{component}{ext}"));
        save_state_dict(&sub, &path).unwrap();
        let reloaded = load_state_dict(&path).unwrap();
        assert_eq!(reloaded.has_quantized(), sub.has_quantized());
        assert_eq!(reloaded.len(), sub.len());
    }
}

#[test]
fn test_combine_later_file_wins() {
    let tmp = TempDir::new().unwrap();
    let a_path = tmp.path().join("a.safetensors");
    let b_path = tmp.path().join("b.safetensors");

    let mut a = StateDict::new();
    a.insert("shared.weight", Tensor::from_f32(vec![2], &[1.0, 1.0]));
    a.insert("only_a.weight", Tensor::from_f32(vec![2], &[2.0, 2.0]));
    save_state_dict(&a, &a_path).unwrap();

    let mut b = StateDict::new();
    b.insert("shared.weight", Tensor::from_f32(vec![2], &[9.0, 9.0]));
    b.insert("only_b.weight", Tensor::from_f32(vec![2], &[3.0, 3.0]));
    save_state_dict(&b, &b_path).unwrap();

    let mut merged = load_state_dict(&a_path).unwrap();
    merged.merge_from(load_state_dict(&b_path).unwrap());

    assert_eq!(merged.len(), 3);
    let shared = merged.get("shared.weight").unwrap();
    assert_eq!(shared.data, Tensor::from_f32(vec![2], &[9.0, 9.0]).data);
    // first-seen position is kept even when the value is replaced
    let keys: Vec<&str> = merged.keys().collect();
    assert_eq!(keys, vec!["shared.weight", "only_a.weight", "only_b.weight"]);

    // reversed input order: a comes last, so a's value wins
    let mut reversed = load_state_dict(&b_path).unwrap();
    reversed.merge_from(load_state_dict(&a_path).unwrap());
    assert_eq!(reversed.len(), 3);
    let shared = reversed.get("shared.weight").unwrap();
    assert_eq!(shared.data, Tensor::from_f32(vec![2], &[1.0, 1.0]).data);
}

#[test]
fn test_fp8_cast_survives_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.safetensors");

    let mut dict = StateDict::new();
    dict.insert("w.weight", weight(&[4, 4]));
    cast_state_dict(&mut dict, Precision::Float8E4M3Fn).unwrap();
    let cast_data = dict.get("w.weight").unwrap().data.clone();

    save_state_dict(&dict, &path).unwrap();
    let reloaded = load_state_dict(&path).unwrap();
    let tensor = reloaded.get("w.weight").unwrap();
    assert_eq!(tensor.dtype, DType::Float8E4M3Fn);
    assert_eq!(tensor.data, cast_data);
}

#[test]
fn test_corrupt_file_is_load_error() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.safetensors");
    std::fs::write(&path, b"definitely not a checkpoint").unwrap();
    assert!(load_state_dict(&path).is_err());
}
