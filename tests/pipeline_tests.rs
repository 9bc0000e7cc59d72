//! End-to-end pipeline tests with the deterministic mock networks
//!
//! Everything except the final WebM write runs without weights or ffmpeg;
//! the encode test is ignored by default and needs ffmpeg on PATH.

use image::{Rgb, RgbImage};
use sd_video::config::{ComputeConfig, DiffusionConfig, GenerationConfig};
use sd_video::latents_bin::load_latents;
use sd_video::mock::{MockDecoder, MockDenoiser, MockTextEmbedder};
use sd_video::{GenerationRequest, Result, SdVideoError, VideoPipeline};

type MockPipeline = VideoPipeline<MockDenoiser, MockTextEmbedder, MockDecoder>;

fn config() -> GenerationConfig {
    GenerationConfig::default()
        .with_latent_size(8, 8)
        .with_steps(3)
        .with_frames(4)
        .with_seed(7)
}

fn pipeline() -> Result<MockPipeline> {
    VideoPipeline::new(
        MockDenoiser::new(),
        MockTextEmbedder::default(),
        MockDecoder::new(2),
        DiffusionConfig::default(),
        config(),
        ComputeConfig::cpu(),
    )
}

fn seed_image() -> RgbImage {
    RgbImage::from_fn(24, 24, |x, y| {
        Rgb([(x * 10) as u8, (y * 10) as u8, ((x + y) * 5) as u8])
    })
}

fn write_seed(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("seed.png");
    seed_image().save(&path).unwrap();
    path
}

fn prompts(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_chained_segments() -> Result<()> {
    let mut pipeline = pipeline()?;
    let seed = seed_image();
    let segments = pipeline.generate_segments(
        &prompts(&["a cat on a roof", "the cat jumps"]),
        "",
        &seed,
        &config(),
    )?;

    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].seed, seed);
    assert_eq!(segments[1].seed, segments[0].frames[3]);
    for segment in &segments {
        assert_eq!(segment.frames.len(), 4);
        assert!(segment.frames.iter().all(|f| f.dimensions() == (16, 16)));
    }
    // 3 steps per segment, one batched call each
    assert_eq!(pipeline.denoiser().calls, 6);
    Ok(())
}

#[test]
fn test_same_seed_same_frames() -> Result<()> {
    let seed = seed_image();
    let lines = prompts(&["waves"]);
    let a = pipeline()?.generate_segments(&lines, "", &seed, &config())?;
    let b = pipeline()?.generate_segments(&lines, "", &seed, &config())?;
    assert_eq!(a[0].frames, b[0].frames);

    let c = pipeline()?.generate_segments(&lines, "", &seed, &config().with_seed(8))?;
    assert_ne!(a[0].frames, c[0].frames);
    Ok(())
}

#[test]
fn test_prompt_embeddings_are_reused() -> Result<()> {
    let mut pipeline = pipeline()?;
    pipeline.generate_segments(
        &prompts(&["one", "two", "one"]),
        "blurry",
        &seed_image(),
        &config(),
    )?;
    assert_eq!(pipeline.conditioning().embedder().calls, 3);
    assert_eq!(pipeline.conditioning().cached_prompts(), 3);
    Ok(())
}

#[test]
fn test_cancelled_pipeline_stops() -> Result<()> {
    let mut pipeline = pipeline()?;
    pipeline.cancellation_token().cancel();
    let err = pipeline
        .generate_segments(&prompts(&["x"]), "", &seed_image(), &config())
        .unwrap_err();
    assert!(matches!(err, SdVideoError::Cancelled { step: 0 }), "{err}");
    assert_eq!(pipeline.denoiser().calls, 0);
    Ok(())
}

#[test]
fn test_progress_callback_sees_every_step() -> Result<()> {
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut pipeline = pipeline()?.with_progress(move |step| {
        sink.lock().unwrap().push(step.index);
    });
    pipeline.generate_segments(&prompts(&["a", "b"]), "", &seed_image(), &config())?;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
    Ok(())
}

#[test]
fn test_latents_dump_per_segment() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("latents.bin");
    let mut pipeline = pipeline()?.with_latents_dump(&dump);
    pipeline.generate_segments(&prompts(&["a", "b"]), "", &seed_image(), &config())?;

    let first = load_latents(&dump, &candle_core::Device::Cpu)?;
    assert_eq!(first.dims(), &[1, 4, 4, 8, 8]);
    assert!(dir.path().join("latents_1.bin").is_file());
    Ok(())
}

#[test]
fn test_empty_prompt_list_rejected() -> Result<()> {
    let err = pipeline()?
        .generate_segments(&[], "", &seed_image(), &config())
        .unwrap_err();
    assert!(matches!(err, SdVideoError::Config(_)), "{err}");
    Ok(())
}

// ============================================================================
// Request-level entry points
// ============================================================================

#[test]
fn test_missing_image_is_invalid() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let request = GenerationRequest::new(
        "a cat",
        dir.path().join("missing.png"),
        dir.path().join("out.webm"),
    );
    let err = pipeline()?.generate(&request).unwrap_err();
    assert!(matches!(err, SdVideoError::InvalidImage { .. }), "{err}");
    Ok(())
}

#[test]
fn test_out_of_range_alpha_rejected() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let request = GenerationRequest::new("a cat", write_seed(dir.path()), dir.path().join("o.webm"))
        .with_frames(4)
        .with_blend(1.5, 0.8);
    let mut pipeline = pipeline()?;
    let err = pipeline.generate(&request).unwrap_err();
    assert!(matches!(err, SdVideoError::Config(_)), "{err}");
    assert_eq!(pipeline.denoiser().calls, 0);
    Ok(())
}

#[test]
fn test_blank_prompts_file_rejected() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let request = GenerationRequest::new("\n   \n", write_seed(dir.path()), dir.path().join("o.webm"))
        .with_frames(4);
    let err = pipeline()?.generate_chained(&request).unwrap_err();
    assert!(matches!(err, SdVideoError::Config(_)), "{err}");
    Ok(())
}

#[test]
#[ignore = "requires ffmpeg on PATH"]
fn test_generate_writes_webm() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("nested").join("video.webm");
    let request = GenerationRequest::new("rain\nsun", write_seed(dir.path()), &output)
        .with_frames(4)
        .with_fps(8);

    let report = pipeline()?.generate_chained(&request)?;
    assert_eq!(report.frame_count, 8);
    assert_eq!(report.segments, 2);
    assert_eq!((report.width, report.height), (16, 16));
    assert!(std::fs::metadata(&output).unwrap().len() > 0);
    Ok(())
}
