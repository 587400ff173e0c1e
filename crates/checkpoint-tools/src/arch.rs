//! Architecture detection and checkpoint splitting.
//!
//! Single-file diffusion checkpoints bundle several sub-models (text
//! encoders, denoiser, VAE) under one flat key namespace. Each supported
//! family is described by a declarative table: signature keys for
//! detection, routing rules mapping source key prefixes to a component
//! bucket plus a rewritten key, and prefixes for training-time buffers
//! that have no place in an inference checkpoint. Adding a family means
//! adding a table.

use crate::statedict::StateDict;
use checkpoint_core::{CheckpointError, Result};
use std::fmt;
use tracing::debug;

/// A supported model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Sd15,
    Sdxl,
    Sd35,
    FluxDev,
    FluxSchnell,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Sd15 => "sd15",
            Architecture::Sdxl => "sdxl",
            Architecture::Sd35 => "sd35",
            Architecture::FluxDev => "flux-dev",
            Architecture::FluxSchnell => "flux-schnell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sd15" => Some(Architecture::Sd15),
            "sdxl" => Some(Architecture::Sdxl),
            "sd35" => Some(Architecture::Sd35),
            "flux-dev" => Some(Architecture::FluxDev),
            "flux-schnell" => Some(Architecture::FluxSchnell),
            _ => None,
        }
    }

    fn table(&self) -> &'static ArchTable {
        match self {
            Architecture::Sd15 => &SD15_TABLE,
            Architecture::Sdxl => &SDXL_TABLE,
            Architecture::Sd35 => &SD35_TABLE,
            Architecture::FluxDev | Architecture::FluxSchnell => &FLUX_TABLE,
        }
    }

    /// Whether a component's tensors may be quantized at all. The VAE is
    /// small and numerically sensitive, so it always stays in float.
    pub fn component_quantizable(&self, component: &str) -> bool {
        component != "vae"
    }

    /// Key substrings that keep a tensor out of quantization for this
    /// family, on top of the global rank/size eligibility rules.
    pub fn quant_exclude_patterns(&self, _component: &str) -> &'static [&'static str] {
        &["norm", "embed", "logit_scale"]
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routes keys under `prefix` into `bucket`, rewriting the prefix.
struct SplitRule {
    prefix: &'static str,
    bucket: &'static str,
    target_prefix: &'static str,
}

struct ArchTable {
    /// Keys whose presence identifies (or validates) the family.
    signature: &'static [&'static str],
    rules: &'static [SplitRule],
    /// Training-time buffers dropped before routing (EMA shadows,
    /// noise-schedule constants).
    drop_prefixes: &'static [&'static str],
    /// Bucket receiving keys no rule matches; `None` makes such keys an
    /// error.
    passthrough: Option<&'static str>,
}

const SCHEDULE_BUFFERS: &[&str] = &[
    "model_ema.",
    "betas",
    "alphas_cumprod",
    "alphas_cumprod_prev",
    "sqrt_alphas_cumprod",
    "sqrt_one_minus_alphas_cumprod",
    "log_one_minus_alphas_cumprod",
    "sqrt_recip_alphas_cumprod",
    "sqrt_recipm1_alphas_cumprod",
    "posterior_variance",
    "posterior_log_variance_clipped",
    "posterior_mean_coef1",
    "posterior_mean_coef2",
    "logvar",
];

static SD15_TABLE: ArchTable = ArchTable {
    signature: &["cond_stage_model.transformer.text_model.embeddings.token_embedding.weight"],
    rules: &[
        SplitRule {
            prefix: "cond_stage_model.transformer.",
            bucket: "text_encoder",
            target_prefix: "",
        },
        SplitRule {
            prefix: "model.diffusion_model.",
            bucket: "unet",
            target_prefix: "",
        },
        SplitRule {
            prefix: "first_stage_model.",
            bucket: "vae",
            target_prefix: "",
        },
    ],
    drop_prefixes: SCHEDULE_BUFFERS,
    passthrough: None,
};

static SDXL_TABLE: ArchTable = ArchTable {
    signature: &["conditioner.embedders.1.model.transformer.resblocks.0.attn.in_proj_weight"],
    rules: &[
        SplitRule {
            prefix: "conditioner.embedders.0.transformer.",
            bucket: "text_encoder",
            target_prefix: "",
        },
        SplitRule {
            prefix: "conditioner.embedders.1.model.",
            bucket: "text_encoder_2",
            target_prefix: "",
        },
        SplitRule {
            prefix: "model.diffusion_model.",
            bucket: "unet",
            target_prefix: "",
        },
        SplitRule {
            prefix: "first_stage_model.",
            bucket: "vae",
            target_prefix: "",
        },
    ],
    drop_prefixes: SCHEDULE_BUFFERS,
    passthrough: None,
};

static SD35_TABLE: ArchTable = ArchTable {
    signature: &["model.diffusion_model.joint_blocks.0.context_block.attn.qkv.weight"],
    rules: &[
        SplitRule {
            prefix: "text_encoders.clip_l.transformer.",
            bucket: "text_encoder",
            target_prefix: "",
        },
        SplitRule {
            prefix: "text_encoders.clip_g.transformer.",
            bucket: "text_encoder_2",
            target_prefix: "",
        },
        SplitRule {
            prefix: "text_encoders.t5xxl.transformer.",
            bucket: "text_encoder_3",
            target_prefix: "",
        },
        SplitRule {
            prefix: "model.diffusion_model.",
            bucket: "transformer",
            target_prefix: "",
        },
        SplitRule {
            prefix: "first_stage_model.",
            bucket: "vae",
            target_prefix: "",
        },
    ],
    drop_prefixes: SCHEDULE_BUFFERS,
    passthrough: None,
};

// Flux checkpoints ship either bare denoiser keys ("double_blocks.0. ...")
// or the same keys under "model.diffusion_model."; both layouts route to
// the transformer bucket.
static FLUX_TABLE: ArchTable = ArchTable {
    signature: &["double_blocks.0.img_attn.qkv.weight"],
    rules: &[
        SplitRule {
            prefix: "model.diffusion_model.",
            bucket: "transformer",
            target_prefix: "",
        },
        SplitRule {
            prefix: "vae.",
            bucket: "vae",
            target_prefix: "",
        },
        SplitRule {
            prefix: "first_stage_model.",
            bucket: "vae",
            target_prefix: "",
        },
    ],
    drop_prefixes: &["model_ema."],
    passthrough: Some("transformer"),
};

const FLUX_GUIDANCE_KEY: &str = "guidance_in.in_layer.weight";

/// Key lookup that tolerates the optional denoiser prefix flux files use.
fn has_denoiser_key(dict: &StateDict, key: &str) -> bool {
    dict.contains_key(key) || dict.contains_key(&format!("model.diffusion_model.{key}"))
}

/// Identify the family from the key set, most specific signature first.
pub fn detect_architecture(dict: &StateDict) -> Result<Architecture> {
    if has_denoiser_key(dict, FLUX_TABLE.signature[0]) {
        // The guidance embedder distinguishes the distilled variants.
        if has_denoiser_key(dict, FLUX_GUIDANCE_KEY) {
            return Ok(Architecture::FluxDev);
        }
        return Ok(Architecture::FluxSchnell);
    }
    for arch in [Architecture::Sd35, Architecture::Sdxl, Architecture::Sd15] {
        if arch.table().signature.iter().all(|k| dict.contains_key(k)) {
            return Ok(arch);
        }
    }
    Err(CheckpointError::UnknownArchitecture)
}

/// Spot-check that the dict is structurally consistent with a hinted
/// family.
pub fn validate_architecture(dict: &StateDict, arch: Architecture) -> Result<()> {
    for key in arch.table().signature {
        let present = match arch {
            Architecture::FluxDev | Architecture::FluxSchnell => has_denoiser_key(dict, key),
            _ => dict.contains_key(key),
        };
        if !present {
            return Err(CheckpointError::ArchitectureMismatch {
                architecture: arch.as_str().to_string(),
                missing: (*key).to_string(),
            });
        }
    }
    if arch == Architecture::FluxDev && !has_denoiser_key(dict, FLUX_GUIDANCE_KEY) {
        return Err(CheckpointError::ArchitectureMismatch {
            architecture: arch.as_str().to_string(),
            missing: FLUX_GUIDANCE_KEY.to_string(),
        });
    }
    Ok(())
}

/// Resolve the family (hint validated, or detected) and partition the dict
/// into per-component state dicts. Buckets appear in table order; empty
/// buckets are omitted. Every key must be routed by a rule, dropped by a
/// drop prefix, or caught by the family's passthrough bucket.
pub fn classify_and_split(
    dict: StateDict,
    hint: Option<Architecture>,
) -> Result<(Architecture, Vec<(&'static str, StateDict)>)> {
    let arch = match hint {
        Some(arch) => {
            validate_architecture(&dict, arch)?;
            arch
        }
        None => detect_architecture(&dict)?,
    };
    let components = split(dict, arch)?;
    Ok((arch, components))
}

fn split(dict: StateDict, arch: Architecture) -> Result<Vec<(&'static str, StateDict)>> {
    let table = arch.table();

    // Bucket order is the table's rule order, passthrough bucket included.
    let mut buckets: Vec<(&'static str, StateDict)> = Vec::new();
    let mut bucket_index = |buckets: &mut Vec<(&'static str, StateDict)>, name: &'static str| {
        match buckets.iter().position(|(b, _)| *b == name) {
            Some(i) => i,
            None => {
                buckets.push((name, StateDict::new()));
                buckets.len() - 1
            }
        }
    };
    for rule in table.rules {
        bucket_index(&mut buckets, rule.bucket);
    }
    if let Some(name) = table.passthrough {
        bucket_index(&mut buckets, name);
    }

    for (key, tensor) in dict {
        if table.drop_prefixes.iter().any(|p| key.starts_with(p)) {
            debug!(%key, "dropping training-time buffer");
            continue;
        }
        let routed = table.rules.iter().find(|r| key.starts_with(r.prefix));
        match routed {
            Some(rule) => {
                let target = format!("{}{}", rule.target_prefix, &key[rule.prefix.len()..]);
                let idx = bucket_index(&mut buckets, rule.bucket);
                buckets[idx].1.insert(target, tensor);
            }
            None => match table.passthrough {
                Some(name) => {
                    let idx = bucket_index(&mut buckets, name);
                    buckets[idx].1.insert(key, tensor);
                }
                None => {
                    return Err(CheckpointError::UnmappedKey {
                        architecture: arch.as_str().to_string(),
                        key,
                    });
                }
            },
        }
    }

    buckets.retain(|(_, dict)| !dict.is_empty());
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statedict::Tensor;

    fn weight(shape: &[usize]) -> Tensor {
        let numel: usize = shape.iter().product();
        Tensor::from_f32(shape.to_vec(), &vec![0.25; numel])
    }

    fn sd15_dict() -> StateDict {
        let mut dict = StateDict::new();
        dict.insert(
            "cond_stage_model.transformer.text_model.embeddings.token_embedding.weight",
            weight(&[49408, 768]),
        );
        dict.insert(
            "cond_stage_model.transformer.text_model.encoder.layers.0.mlp.fc1.weight",
            weight(&[3072, 768]),
        );
        dict.insert("model.diffusion_model.input_blocks.0.0.weight", weight(&[320, 4, 3, 3]));
        dict.insert("model.diffusion_model.out.2.bias", weight(&[4]));
        dict.insert("first_stage_model.encoder.conv_in.weight", weight(&[128, 3, 3, 3]));
        dict.insert("alphas_cumprod", weight(&[1000]));
        dict.insert("model_ema.decay", weight(&[1]));
        dict
    }

    #[test]
    fn test_detect_sd15() {
        assert_eq!(detect_architecture(&sd15_dict()).unwrap(), Architecture::Sd15);
    }

    #[test]
    fn test_detect_sdxl() {
        let mut dict = sd15_dict();
        dict.insert(
            "conditioner.embedders.1.model.transformer.resblocks.0.attn.in_proj_weight",
            weight(&[3840, 1280]),
        );
        assert_eq!(detect_architecture(&dict).unwrap(), Architecture::Sdxl);
    }

    #[test]
    fn test_detect_sd35() {
        let mut dict = StateDict::new();
        dict.insert(
            "model.diffusion_model.joint_blocks.0.context_block.attn.qkv.weight",
            weight(&[4608, 1536]),
        );
        assert_eq!(detect_architecture(&dict).unwrap(), Architecture::Sd35);
    }

    #[test]
    fn test_detect_flux_variants() {
        let mut dict = StateDict::new();
        dict.insert("double_blocks.0.img_attn.qkv.weight", weight(&[9216, 3072]));
        assert_eq!(detect_architecture(&dict).unwrap(), Architecture::FluxSchnell);

        dict.insert("guidance_in.in_layer.weight", weight(&[3072, 256]));
        assert_eq!(detect_architecture(&dict).unwrap(), Architecture::FluxDev);
    }

    #[test]
    fn test_detect_flux_with_denoiser_prefix() {
        let mut dict = StateDict::new();
        dict.insert(
            "model.diffusion_model.double_blocks.0.img_attn.qkv.weight",
            weight(&[9216, 3072]),
        );
        dict.insert(
            "model.diffusion_model.guidance_in.in_layer.weight",
            weight(&[3072, 256]),
        );
        assert_eq!(detect_architecture(&dict).unwrap(), Architecture::FluxDev);
    }

    #[test]
    fn test_detect_unknown() {
        let mut dict = StateDict::new();
        dict.insert("decoder.layers.0.weight", weight(&[16, 16]));
        assert!(matches!(
            detect_architecture(&dict),
            Err(CheckpointError::UnknownArchitecture)
        ));
    }

    #[test]
    fn test_split_sd15_components() {
        let (arch, components) = classify_and_split(sd15_dict(), None).unwrap();
        assert_eq!(arch, Architecture::Sd15);
        let names: Vec<&str> = components.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["text_encoder", "unet", "vae"]);

        let (_, text_encoder) = &components[0];
        assert!(text_encoder.contains_key("text_model.embeddings.token_embedding.weight"));
        let (_, unet) = &components[1];
        assert!(unet.contains_key("input_blocks.0.0.weight"));
        assert!(unet.contains_key("out.2.bias"));
    }

    #[test]
    fn test_split_drops_schedule_buffers() {
        let (_, components) = classify_and_split(sd15_dict(), None).unwrap();
        for (_, dict) in &components {
            assert!(!dict.contains_key("alphas_cumprod"));
            assert!(!dict.keys().any(|k| k.contains("model_ema")));
        }
    }

    #[test]
    fn test_split_unmapped_key_is_error() {
        let mut dict = sd15_dict();
        dict.insert("surprise.weight", weight(&[4, 4]));
        let err = classify_and_split(dict, None).unwrap_err();
        match err {
            CheckpointError::UnmappedKey { architecture, key } => {
                assert_eq!(architecture, "sd15");
                assert_eq!(key, "surprise.weight");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_split_flux_passthrough() {
        let mut dict = StateDict::new();
        dict.insert("double_blocks.0.img_attn.qkv.weight", weight(&[9216, 3072]));
        dict.insert("final_layer.linear.weight", weight(&[64, 3072]));
        let (arch, components) = classify_and_split(dict, None).unwrap();
        assert_eq!(arch, Architecture::FluxSchnell);
        assert_eq!(components.len(), 1);
        let (name, transformer) = &components[0];
        assert_eq!(*name, "transformer");
        assert!(transformer.contains_key("double_blocks.0.img_attn.qkv.weight"));
        assert!(transformer.contains_key("final_layer.linear.weight"));
    }

    #[test]
    fn test_hint_validation() {
        assert!(classify_and_split(sd15_dict(), Some(Architecture::Sd15)).is_ok());

        let err = classify_and_split(sd15_dict(), Some(Architecture::Sdxl)).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::ArchitectureMismatch { .. }
        ));
    }

    #[test]
    fn test_hint_flux_dev_requires_guidance() {
        let mut dict = StateDict::new();
        dict.insert("double_blocks.0.img_attn.qkv.weight", weight(&[9216, 3072]));
        let err = classify_and_split(dict, Some(Architecture::FluxDev)).unwrap_err();
        match err {
            CheckpointError::ArchitectureMismatch { missing, .. } => {
                assert_eq!(missing, "guidance_in.in_layer.weight");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_buckets_omitted() {
        let mut dict = StateDict::new();
        dict.insert(
            "model.diffusion_model.joint_blocks.0.context_block.attn.qkv.weight",
            weight(&[4608, 1536]),
        );
        let (_, components) = classify_and_split(dict, None).unwrap();
        let names: Vec<&str> = components.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["transformer"]);
    }

    #[test]
    fn test_architecture_parse_round_trip() {
        for arch in [
            Architecture::Sd15,
            Architecture::Sdxl,
            Architecture::Sd35,
            Architecture::FluxDev,
            Architecture::FluxSchnell,
        ] {
            assert_eq!(Architecture::parse(arch.as_str()), Some(arch));
        }
        assert_eq!(Architecture::parse("sd2"), None);
    }
}
