//! Model directory parsing and validation tests

use std::fs;
use std::path::Path;

use sd_video::config::{ConfigError, PredictionType};
use sd_video::loader::{CONFIG_FILE, LoaderError};
use sd_video::ModelDirectory;

fn write_config(dir: &Path, model_cfg: &str) {
    let json = format!(
        r#"{{
            "model": {{
                "model_cfg": {model_cfg},
                "model_args": {{
                    "ckpt_unet": "unet.safetensors",
                    "ckpt_autoencoder": "vae.safetensors",
                    "ckpt_clip": "clip.safetensors"
                }}
            }}
        }}"#
    );
    fs::write(dir.join(CONFIG_FILE), json).unwrap();
}

fn touch_weights(dir: &Path) {
    for name in [
        "unet.safetensors",
        "vae.safetensors",
        "clip.safetensors",
        "tokenizer.json",
    ] {
        fs::write(dir.join(name), b"").unwrap();
    }
}

const MODEL_CFG: &str = r#"{
    "unet_in_dim": 4, "unet_dim": 320, "unet_y_dim": 768,
    "unet_context_dim": 1024, "unet_out_dim": 4,
    "unet_dim_mult": [1, 2, 4, 4], "unet_head_dim": 64,
    "unet_res_blocks": 2, "unet_attn_scales": [1, 0.5, 0.25],
    "unet_dropout": 0.1, "temporal_attention": "False",
    "num_timesteps": 1000, "mean_type": "eps"
}"#;

#[test]
fn test_open_valid_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), MODEL_CFG);
    touch_weights(dir.path());

    let model_dir = ModelDirectory::open(dir.path()).unwrap();
    let cfg = &model_dir.config().model.model_cfg;
    assert_eq!(cfg.unet_context_dim, 1024);
    assert_eq!(cfg.unet_dim_mult, vec![1, 2, 4, 4]);
    assert!(!cfg.temporal_attention);
    assert_eq!(model_dir.weights().unet, dir.path().join("unet.safetensors"));
    assert_eq!(model_dir.weights().tokenizer, dir.path().join("tokenizer.json"));

    let diffusion = model_dir.config().diffusion();
    assert_eq!(diffusion.num_train_timesteps, 1000);
    assert_eq!(diffusion.prediction_type, PredictionType::Epsilon);
}

#[test]
fn test_missing_weights_are_listed() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), MODEL_CFG);
    fs::write(dir.path().join("unet.safetensors"), b"").unwrap();

    match ModelDirectory::open(dir.path()) {
        Err(LoaderError::MissingWeights { missing }) => {
            assert_eq!(missing.len(), 3);
            assert!(missing.iter().any(|m| m.ends_with("vae.safetensors")));
            assert!(!missing.iter().any(|m| m.ends_with("unet.safetensors")));
        }
        other => panic!("expected MissingWeights, got {other:?}"),
    }
}

#[test]
fn test_missing_config() {
    let dir = tempfile::tempdir().unwrap();
    let err = ModelDirectory::open(dir.path()).unwrap_err();
    assert!(matches!(err, LoaderError::FileRead { .. }), "{err}");
}

#[test]
fn test_malformed_json() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(CONFIG_FILE), "{ \"model\": ").unwrap();
    let err = ModelDirectory::open(dir.path()).unwrap_err();
    assert!(matches!(err, LoaderError::JsonParse { .. }), "{err}");
}

#[test]
fn test_wrong_latent_channels() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"{"unet_in_dim": 8, "unet_dim": 320, "unet_context_dim": 1024, "unet_out_dim": 4}"#,
    );
    touch_weights(dir.path());
    let err = ModelDirectory::open(dir.path()).unwrap_err();
    assert!(matches!(err, LoaderError::InvalidConfig(_)), "{err}");
}

#[test]
fn test_v_prediction_and_boolean_flag() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"{"unet_in_dim": 4, "unet_dim": 320, "unet_context_dim": 1024, "unet_out_dim": 4,
            "temporal_attention": false, "mean_type": "v", "num_timesteps": 500}"#,
    );
    touch_weights(dir.path());
    let model_dir = ModelDirectory::open(dir.path()).unwrap();
    assert!(!model_dir.config().model.model_cfg.temporal_attention);
    let diffusion = model_dir.config().diffusion();
    assert_eq!(diffusion.prediction_type, PredictionType::VPrediction);
    assert_eq!(diffusion.num_train_timesteps, 500);
}

#[test]
fn test_unknown_boolean_string_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        dir.path(),
        r#"{"unet_in_dim": 4, "unet_dim": 320, "unet_context_dim": 1024, "unet_out_dim": 4,
            "temporal_attention": "maybe"}"#,
    );
    touch_weights(dir.path());
    let err = ModelDirectory::open(dir.path()).unwrap_err();
    assert!(matches!(err, LoaderError::JsonParse { .. }), "{err}");
}

// ============================================================================
// Architecture checks
// ============================================================================

fn open_with(model_cfg: &str) -> Result<ModelDirectory, LoaderError> {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), model_cfg);
    touch_weights(dir.path());
    ModelDirectory::open(dir.path())
}

fn rejected_field(err: LoaderError) -> &'static str {
    match err {
        LoaderError::InvalidConfig(ConfigError::UnsupportedArchitecture { field, .. }) => field,
        other => panic!("expected UnsupportedArchitecture, got {other:?}"),
    }
}

#[test]
fn test_temporal_attention_rejected() {
    let cfg = MODEL_CFG.replace(
        r#""temporal_attention": "False""#,
        r#""temporal_attention": "True""#,
    );
    assert_eq!(rejected_field(open_with(&cfg).unwrap_err()), "temporal_attention");
}

#[test]
fn test_context_width_mismatch_rejected() {
    let cfg = MODEL_CFG.replace(r#""unet_context_dim": 1024"#, r#""unet_context_dim": 768"#);
    assert_eq!(rejected_field(open_with(&cfg).unwrap_err()), "unet_context_dim");
}

#[test]
fn test_unet_layout_mismatch_rejected() {
    let cfg = MODEL_CFG.replace(r#""unet_dim": 320"#, r#""unet_dim": 256"#);
    assert_eq!(rejected_field(open_with(&cfg).unwrap_err()), "unet_dim");

    let cfg = MODEL_CFG.replace("[1, 2, 4, 4]", "[1, 2, 2, 4]");
    assert_eq!(rejected_field(open_with(&cfg).unwrap_err()), "unet_dim_mult");

    let cfg = MODEL_CFG.replace(r#""unet_res_blocks": 2"#, r#""unet_res_blocks": 1"#);
    assert_eq!(rejected_field(open_with(&cfg).unwrap_err()), "unet_res_blocks");

    let cfg = MODEL_CFG.replace(
        r#""unet_head_dim": 64"#,
        r#""unet_head_dim": 64, "unet_num_heads": 8"#,
    );
    assert_eq!(rejected_field(open_with(&cfg).unwrap_err()), "unet_num_heads");

    let cfg = MODEL_CFG.replace("[1, 0.5, 0.25]", "[1, 0.5]");
    assert_eq!(rejected_field(open_with(&cfg).unwrap_err()), "unet_attn_scales");
}
