use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A pipeline stage — one HTTP round trip that produces or transforms an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Generate,
    Refine,
    Adetailer,
    Upscale,
}

impl Stage {
    /// Stage tag used for output subdirectories, filenames, and summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            Stage::Generate => "generate",
            Stage::Refine => "refine",
            Stage::Adetailer => "adetailer",
            Stage::Upscale => "upscale",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

// ── Wire payloads ───────────────────────────────────────────────────

/// Request body for `/sdapi/v1/txt2img`.
///
/// Hires-fix fields are always sent; the service ignores them when
/// `enable_hr` is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txt2ImgPayload {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub sampler_name: String,
    pub scheduler: String,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
    pub seed_resize_from_h: i64,
    pub seed_resize_from_w: i64,
    pub clip_skip: u32,
    pub batch_size: u32,
    pub n_iter: u32,
    pub restore_faces: bool,
    pub tiling: bool,
    pub do_not_save_samples: bool,
    pub do_not_save_grid: bool,
    pub enable_hr: bool,
    pub hr_scale: f64,
    pub hr_upscaler: String,
    pub hr_second_pass_steps: u32,
    pub hr_resize_x: u32,
    pub hr_resize_y: u32,
    pub denoising_strength: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub styles: Vec<String>,
}

/// Request body for `/sdapi/v1/img2img`.
///
/// `alwayson_scripts` carries extension payloads (ADetailer) and is omitted
/// from the wire when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Img2ImgPayload {
    pub init_images: Vec<String>,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub sampler_name: String,
    pub scheduler: String,
    pub cfg_scale: f64,
    pub denoising_strength: f64,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
    pub clip_skip: u32,
    pub batch_size: u32,
    pub n_iter: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub alwayson_scripts: Option<serde_json::Value>,
}

/// Request body for `/sdapi/v1/extra-single-image`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscalePayload {
    pub image: String,
    pub resize_mode: u32,
    pub upscaling_resize: f64,
    pub upscaler_1: String,
    pub upscaler_2: String,
    pub extras_upscaler_2_visibility: f64,
    pub gfpgan_visibility: f64,
    pub codeformer_visibility: f64,
    pub codeformer_weight: f64,
}

/// Response from txt2img/img2img: base64-encoded images in API order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub images: Vec<String>,
}

/// Response from the extras endpoint: a single base64-encoded image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscaleResponse {
    pub image: String,
}

// ── Run records ─────────────────────────────────────────────────────

/// One successfully completed stage invocation.
///
/// Created only after the service call succeeded AND the image was
/// persisted; immutable afterward. Written verbatim as the JSON manifest
/// sharing the image's base name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Generated identifier: stage tag (or name prefix) + timestamp + index.
    pub name: String,
    pub stage: Stage,
    /// Creation time, `%Y%m%d_%H%M%S`.
    pub timestamp: String,
    pub prompt: String,
    /// Negative prompt after safety augmentation.
    pub negative_prompt: String,
    /// Negative prompt as configured, kept for audit.
    pub original_negative_prompt: String,
    /// The exact request parameters sent, for reproducibility.
    pub request_payload: serde_json::Value,
    /// Input image consumed by this stage; absent for the first stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<PathBuf>,
    pub output_path: PathBuf,
}

/// Summary of one image's journey through the enabled stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub prompt: String,
    pub timestamp: String,
    pub generate_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refine_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adetailer_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upscale_path: Option<PathBuf>,
    /// Stage tags that actually executed and succeeded, in order.
    pub stages_completed: Vec<Stage>,
    /// Output of the last successfully completed stage.
    pub final_image_path: PathBuf,
}

/// Aggregate result of one full pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub run_dir: PathBuf,
    pub prompt: String,
    pub generate: Vec<StageResult>,
    pub refine: Vec<StageResult>,
    pub adetailer: Vec<StageResult>,
    pub upscale: Vec<StageResult>,
    pub summary: Vec<RunSummary>,
}

// ── Randomizer output ───────────────────────────────────────────────

/// One expanded prompt produced by the randomizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptVariant {
    pub text: String,
    /// Human-readable trace of the substitutions applied, if any.
    pub label: Option<String>,
}

impl PromptVariant {
    pub fn identity(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            label: None,
        }
    }
}

// ── Progress reporting ──────────────────────────────────────────────

/// Emitted at stage boundaries while a run is executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Stage label, e.g. `"generate"` or `"refine (2/3)"`.
    pub stage: String,
    /// Percent of completed work units, 0.0–100.0.
    pub percent: f64,
    /// Human-friendly ETA text, e.g. `"ETA: 02:30"` or `"ETA: --"`.
    pub eta: String,
}
