use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Local;
use tracing::{debug, info};

use crate::error::Result;
use crate::types::{RunSummary, StageResult};

/// Subdirectories created inside every run directory.
const RUN_SUBDIRS: [&str; 6] = [
    "generate",
    "refine",
    "adetailer",
    "upscale",
    "video",
    "manifests",
];

/// File timestamp in the fixed `YYYYmmdd_HHMMSS` form used throughout
/// run directories and image names.
pub fn file_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Writes run outputs: images, JSON manifests, the CSV summary, and the
/// combined rollup. All paths live under one run directory per pipeline run.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    output_dir: PathBuf,
}

impl RunArtifacts {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Create `output/<run_YYYYmmdd_HHMMSS>/` (or `<name>/` when given) with
    /// the stage, video, and manifest subdirectories.
    pub fn create_run_dir(&self, run_name: Option<&str>) -> Result<PathBuf> {
        let dir_name = match run_name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("run_{}", file_timestamp()),
        };
        let run_dir = self.output_dir.join(dir_name);
        for sub in RUN_SUBDIRS {
            fs::create_dir_all(run_dir.join(sub))?;
        }
        info!("created run directory {:?}", run_dir);
        Ok(run_dir)
    }

    /// Write the per-image JSON manifest under `manifests/`, sharing the
    /// image's base name.
    pub fn save_manifest(&self, run_dir: &Path, result: &StageResult) -> Result<PathBuf> {
        let path = run_dir
            .join("manifests")
            .join(format!("{}.json", result.name));
        fs::write(&path, serde_json::to_string_pretty(result)?)?;
        debug!("wrote manifest {:?}", path);
        Ok(path)
    }

    /// Write `summary.csv` in the run directory, one row per image chain.
    pub fn write_csv_summary(&self, run_dir: &Path, summaries: &[RunSummary]) -> Result<PathBuf> {
        let path = run_dir.join("summary.csv");
        let mut out = String::from(
            "prompt,timestamp,generate_path,refine_path,adetailer_path,upscale_path,final_image_path,stages_completed\n",
        );
        for summary in summaries {
            let stages = summary
                .stages_completed
                .iter()
                .map(|s| s.tag())
                .collect::<Vec<_>>()
                .join("|");
            let row = [
                csv_field(&summary.prompt),
                csv_field(&summary.timestamp),
                csv_field(&summary.generate_path.to_string_lossy()),
                csv_field(
                    &summary
                        .refine_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ),
                csv_field(
                    &summary
                        .adetailer_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ),
                csv_field(
                    &summary
                        .upscale_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ),
                csv_field(&summary.final_image_path.to_string_lossy()),
                csv_field(&stages),
            ];
            out.push_str(&row.join(","));
            out.push('\n');
        }
        fs::write(&path, out)?;
        info!("wrote summary for {} image(s) to {:?}", summaries.len(), path);
        Ok(path)
    }

    /// Write `rollup.json`: one array combining every manifest of the run.
    pub fn write_rollup(&self, run_dir: &Path, results: &[&StageResult]) -> Result<PathBuf> {
        let path = run_dir.join("rollup.json");
        fs::write(&path, serde_json::to_string_pretty(&results)?)?;
        debug!("wrote rollup with {} entries", results.len());
        Ok(path)
    }

    /// Decode a base64 image payload and persist it.
    pub fn save_image_from_base64(&self, path: &Path, data: &str) -> Result<()> {
        let bytes = BASE64
            .decode(data)
            .map_err(|e| crate::error::PipelineError::Other(format!("invalid base64 image: {}", e)))?;
        fs::write(path, bytes)?;
        debug!("saved image {:?}", path);
        Ok(())
    }

    /// Read an image file back as a base64 payload for img2img/upscale input.
    pub fn load_image_to_base64(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path)?;
        Ok(BASE64.encode(bytes))
    }
}

/// Quote a CSV field when it contains a comma, quote, or newline.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
