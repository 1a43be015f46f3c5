use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::artifacts::{file_timestamp, RunArtifacts};
use crate::client::GenerationApi;
use crate::config::{AppConfig, ConfigStore};
use crate::error::{PipelineError, Result};
use crate::state::CancelToken;
use crate::types::{
    Img2ImgPayload, ProgressUpdate, RunReport, RunSummary, Stage, StageResult, Txt2ImgPayload,
    UpscalePayload,
};

type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Drives the generate → refine → upscale sequence (with an optional
/// detail-enhancement pass between refine and upscale) against a generation
/// service, persisting every successful stage output with its manifest.
///
/// Failed stages never abort the run: a `None` from the client is logged and
/// the chain skips forward, so a failed refine still feeds the generate
/// output into upscale. Cancellation is polled between every call and after
/// every saved image; a pending cancel returns whatever was accumulated.
pub struct Pipeline<C: GenerationApi> {
    client: C,
    store: ConfigStore,
    artifacts: RunArtifacts,
    progress: Option<ProgressCallback>,
}

impl<C: GenerationApi> Pipeline<C> {
    pub fn new(client: C, store: ConfigStore, artifacts: RunArtifacts) -> Self {
        Self {
            client,
            store,
            artifacts,
            progress: None,
        }
    }

    /// Register a callback receiving progress updates at stage boundaries.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run the full pipeline for one prompt.
    ///
    /// `batch_size` images are requested in a single generate call; each
    /// saved image then flows through the enabled refine and upscale stages
    /// as its own chain. Returns the accumulated report, partial when
    /// cancelled mid-run.
    pub async fn run_full_pipeline(
        &self,
        prompt: &str,
        config: &AppConfig,
        run_name: Option<&str>,
        batch_size: u32,
        token: &CancelToken,
    ) -> Result<RunReport> {
        let (name_prefix, prompt) = extract_name_prefix(prompt);
        let mut report = RunReport {
            prompt: prompt.clone(),
            ..Default::default()
        };

        if token.is_cancelled() {
            info!("cancellation pending before run start; nothing executed");
            return Ok(report);
        }

        let run_dir = self.artifacts.create_run_dir(run_name)?;
        report.run_dir = run_dir.clone();

        let units_per_image = 1
            + u32::from(config.pipeline.refine_enabled)
            + u32::from(config.pipeline.adetailer_enabled)
            + u32::from(config.pipeline.upscale_enabled);
        let total_units = (batch_size.max(1) * units_per_image) as usize;
        let mut tracker = ProgressTracker::new(total_units);

        // ── Generate ────────────────────────────────────────────────
        self.apply_model_selection(&config.generate.model, &config.generate.vae)
            .await;

        let generated = self
            .run_txt2img(&prompt, config, &run_dir, name_prefix.as_deref(), batch_size, token)
            .await?;
        if generated.is_empty() {
            if token.is_cancelled() {
                return Ok(report);
            }
            // Nothing to feed the remaining stages; the run itself failed.
            return Err(PipelineError::StageFailed {
                stage: Stage::Generate.tag().to_string(),
                message: "service returned no images".to_string(),
            });
        }
        let cancelled_mid_batch = token.is_cancelled();
        tracker.complete_units(&self.progress, "generate", generated.len());
        report.generate = generated;

        // ── Refine / upscale per image chain ────────────────────────
        let mut summaries = Vec::new();
        let chain_count = report.generate.len();
        for idx in 0..chain_count {
            let generate_result = report.generate[idx].clone();
            let mut stages_completed = vec![Stage::Generate];
            let mut last_good = generate_result.output_path.clone();
            let mut refine_path = None;
            let mut adetailer_path = None;
            let mut upscale_path = None;

            if config.pipeline.refine_enabled && !cancelled_mid_batch {
                if token.is_cancelled() {
                    break;
                }
                let label = format!("refine ({}/{})", idx + 1, chain_count);
                match self
                    .run_img2img(&prompt, config, &run_dir, &last_good, idx)
                    .await
                {
                    Some(result) => {
                        last_good = result.output_path.clone();
                        refine_path = Some(result.output_path.clone());
                        stages_completed.push(Stage::Refine);
                        report.refine.push(result);
                    }
                    None => {
                        warn!(
                            "refine failed for image {}; continuing with generate output",
                            idx
                        );
                    }
                }
                tracker.complete_units(&self.progress, &label, 1);
            }

            if config.pipeline.adetailer_enabled && !cancelled_mid_batch {
                if token.is_cancelled() {
                    break;
                }
                let label = format!("adetailer ({}/{})", idx + 1, chain_count);
                match self
                    .run_adetailer(&prompt, config, &run_dir, &last_good, idx)
                    .await
                {
                    Some(result) => {
                        last_good = result.output_path.clone();
                        adetailer_path = Some(result.output_path.clone());
                        stages_completed.push(Stage::Adetailer);
                        report.adetailer.push(result);
                    }
                    None => {
                        warn!("adetailer failed for image {}; keeping prior output", idx);
                    }
                }
                tracker.complete_units(&self.progress, &label, 1);
            }

            if config.pipeline.upscale_enabled && !cancelled_mid_batch {
                if token.is_cancelled() {
                    break;
                }
                let label = format!("upscale ({}/{})", idx + 1, chain_count);
                match self
                    .run_upscale(&prompt, config, &run_dir, &last_good, idx)
                    .await
                {
                    Some(result) => {
                        last_good = result.output_path.clone();
                        upscale_path = Some(result.output_path.clone());
                        stages_completed.push(Stage::Upscale);
                        report.upscale.push(result);
                    }
                    None => {
                        warn!("upscale failed for image {}; keeping prior output", idx);
                    }
                }
                tracker.complete_units(&self.progress, &label, 1);
            }

            summaries.push(RunSummary {
                prompt: prompt.clone(),
                timestamp: generate_result.timestamp.clone(),
                generate_path: generate_result.output_path.clone(),
                refine_path,
                adetailer_path,
                upscale_path,
                stages_completed,
                final_image_path: last_good,
            });
        }

        // Chains that never started (cancelled between chains) still get a
        // generate-only summary so every saved image appears in the CSV.
        for idx in summaries.len()..chain_count {
            let generate_result = &report.generate[idx];
            summaries.push(RunSummary {
                prompt: prompt.clone(),
                timestamp: generate_result.timestamp.clone(),
                generate_path: generate_result.output_path.clone(),
                refine_path: None,
                adetailer_path: None,
                upscale_path: None,
                stages_completed: vec![Stage::Generate],
                final_image_path: generate_result.output_path.clone(),
            });
        }

        if !summaries.is_empty() {
            self.artifacts.write_csv_summary(&run_dir, &summaries)?;
            let all: Vec<&StageResult> = report
                .generate
                .iter()
                .chain(report.refine.iter())
                .chain(report.adetailer.iter())
                .chain(report.upscale.iter())
                .collect();
            self.artifacts.write_rollup(&run_dir, &all)?;
        }
        report.summary = summaries;

        info!(
            "run complete: {} generated, {} refined, {} detailed, {} upscaled",
            report.generate.len(),
            report.refine.len(),
            report.adetailer.len(),
            report.upscale.len()
        );
        Ok(report)
    }

    async fn apply_model_selection(&self, model: &str, vae: &str) {
        if !model.is_empty() && !self.client.set_model(model).await {
            warn!("could not switch model to '{}'; using current model", model);
        }
        if !vae.is_empty() && !self.client.set_vae(vae).await {
            warn!("could not switch VAE to '{}'; using current VAE", vae);
        }
    }

    /// Generate stage: one txt2img call for the whole batch, saving images
    /// in API-response order. Cancellation is re-checked after each save so
    /// a mid-batch cancel keeps what is on disk and drops the rest.
    async fn run_txt2img(
        &self,
        prompt: &str,
        config: &AppConfig,
        run_dir: &Path,
        name_prefix: Option<&str>,
        batch_size: u32,
        token: &CancelToken,
    ) -> Result<Vec<StageResult>> {
        let generate = &config.generate;
        let (sampler_name, scheduler) =
            parse_sampler(&generate.sampler_name, &generate.scheduler);
        let negative = self.store.add_safety_suffix(&generate.negative_prompt);
        let payload = Txt2ImgPayload {
            prompt: prompt.to_string(),
            negative_prompt: negative.clone(),
            steps: generate.steps,
            sampler_name,
            scheduler,
            cfg_scale: generate.cfg_scale,
            width: generate.width,
            height: generate.height,
            seed: generate.seed,
            seed_resize_from_h: generate.seed_resize_from_h,
            seed_resize_from_w: generate.seed_resize_from_w,
            clip_skip: generate.clip_skip,
            batch_size: batch_size.max(1),
            n_iter: generate.n_iter,
            restore_faces: generate.restore_faces,
            tiling: generate.tiling,
            do_not_save_samples: generate.do_not_save_samples,
            do_not_save_grid: generate.do_not_save_grid,
            enable_hr: generate.enable_hr,
            hr_scale: generate.hr_scale,
            hr_upscaler: generate.hr_upscaler.clone(),
            hr_second_pass_steps: generate.hr_second_pass_steps,
            hr_resize_x: generate.hr_resize_x,
            hr_resize_y: generate.hr_resize_y,
            denoising_strength: generate.denoising_strength,
            styles: generate.styles.clone(),
        };

        let Some(response) = self.client.txt2img(&payload).await else {
            return Ok(Vec::new());
        };
        if response.images.is_empty() {
            error!("txt2img returned an empty image list");
            return Ok(Vec::new());
        }

        let tag = name_prefix.unwrap_or(Stage::Generate.tag());
        let timestamp = file_timestamp();
        let payload_value = serde_json::to_value(&payload)?;
        let mut results = Vec::new();
        for (idx, image) in response.images.iter().enumerate() {
            let name = format!("{}_{}_{:03}", tag, timestamp, idx);
            let path = run_dir
                .join(Stage::Generate.tag())
                .join(format!("{}.png", name));
            self.artifacts.save_image_from_base64(&path, image)?;
            let result = StageResult {
                name,
                stage: Stage::Generate,
                timestamp: timestamp.clone(),
                prompt: prompt.to_string(),
                negative_prompt: negative.clone(),
                original_negative_prompt: generate.negative_prompt.clone(),
                request_payload: payload_value.clone(),
                source_image: None,
                output_path: path,
            };
            self.artifacts.save_manifest(run_dir, &result)?;
            results.push(result);
            if token.is_cancelled() {
                warn!(
                    "cancelled mid-batch; kept {} of {} image(s)",
                    results.len(),
                    response.images.len()
                );
                break;
            }
        }
        Ok(results)
    }

    /// Refine stage for one image. Returns `None` on any failure so the
    /// caller can skip forward.
    async fn run_img2img(
        &self,
        prompt: &str,
        config: &AppConfig,
        run_dir: &Path,
        source: &Path,
        idx: usize,
    ) -> Option<StageResult> {
        let refine = &config.refine;
        if !refine.model.is_empty() || !refine.vae.is_empty() {
            self.apply_model_selection(&refine.model, &refine.vae).await;
        }
        let init_image = match self.artifacts.load_image_to_base64(source) {
            Ok(data) => data,
            Err(e) => {
                error!("could not read refine input {:?}: {}", source, e);
                return None;
            }
        };
        let (sampler_name, scheduler) = parse_sampler(&refine.sampler_name, &refine.scheduler);
        let negative = self.store.add_safety_suffix(&refine.negative_prompt);
        let payload = Img2ImgPayload {
            init_images: vec![init_image],
            prompt: prompt.to_string(),
            negative_prompt: negative.clone(),
            steps: refine.steps,
            sampler_name,
            scheduler,
            cfg_scale: refine.cfg_scale,
            denoising_strength: refine.denoising_strength,
            width: refine.width,
            height: refine.height,
            seed: refine.seed,
            clip_skip: refine.clip_skip,
            batch_size: 1,
            n_iter: 1,
            alwayson_scripts: None,
        };

        let response = self.client.img2img(&payload).await?;
        let image = response.images.first()?;
        let timestamp = file_timestamp();
        let name = format!("{}_{}_{:03}", Stage::Refine.tag(), timestamp, idx);
        let path = run_dir
            .join(Stage::Refine.tag())
            .join(format!("{}.png", name));
        // The manifest drops the inline image payload to stay readable.
        let mut payload_value = serde_json::to_value(&payload).ok()?;
        if let Some(map) = payload_value.as_object_mut() {
            map.remove("init_images");
        }
        self.save_stage_output(
            run_dir,
            StageOutput {
                name,
                stage: Stage::Refine,
                timestamp,
                prompt,
                negative_prompt: negative,
                original_negative_prompt: &refine.negative_prompt,
                payload: payload_value,
                source: Some(source.to_path_buf()),
                path,
                image,
            },
        )
    }

    /// ADetailer stage for one image: img2img with the extension's
    /// `alwayson_scripts` payload for automatic face/detail enhancement.
    /// Returns `None` on any failure so the caller can skip forward.
    async fn run_adetailer(
        &self,
        prompt: &str,
        config: &AppConfig,
        run_dir: &Path,
        source: &Path,
        idx: usize,
    ) -> Option<StageResult> {
        let adetailer = &config.adetailer;
        let init_image = match self.artifacts.load_image_to_base64(source) {
            Ok(data) => data,
            Err(e) => {
                error!("could not read adetailer input {:?}: {}", source, e);
                return None;
            }
        };
        let stage_prompt = if adetailer.prompt.is_empty() {
            prompt.to_string()
        } else {
            adetailer.prompt.clone()
        };
        let (sampler_name, scheduler) = parse_sampler(&adetailer.sampler_name, "");
        let negative = self.store.add_safety_suffix(&adetailer.negative_prompt);
        let scripts = serde_json::json!({
            "ADetailer": {
                "args": [{
                    "ad_model": adetailer.model,
                    "ad_confidence": adetailer.confidence,
                    "ad_mask_blur": adetailer.mask_feather,
                    "ad_denoising_strength": adetailer.denoising_strength,
                    "ad_inpaint_only_masked": true,
                    "ad_inpaint_only_masked_padding": 32,
                    "ad_use_inpaint_width_height": false,
                    "ad_sampler": adetailer.sampler_name,
                    "ad_steps": adetailer.steps,
                    "ad_cfg_scale": adetailer.cfg_scale,
                    "ad_prompt": adetailer.prompt,
                    "ad_negative_prompt": adetailer.negative_prompt,
                }]
            }
        });
        let payload = Img2ImgPayload {
            init_images: vec![init_image],
            prompt: stage_prompt.clone(),
            negative_prompt: negative.clone(),
            steps: adetailer.steps,
            sampler_name,
            scheduler,
            cfg_scale: adetailer.cfg_scale,
            denoising_strength: adetailer.denoising_strength,
            width: adetailer.width,
            height: adetailer.height,
            seed: -1,
            clip_skip: config.generate.clip_skip,
            batch_size: 1,
            n_iter: 1,
            alwayson_scripts: Some(scripts),
        };

        let response = self.client.img2img(&payload).await?;
        let image = response.images.first()?;
        let timestamp = file_timestamp();
        let name = format!("{}_{}_{:03}", Stage::Adetailer.tag(), timestamp, idx);
        let path = run_dir
            .join(Stage::Adetailer.tag())
            .join(format!("{}.png", name));
        // The manifest drops the inline image payload to stay readable.
        let mut payload_value = serde_json::to_value(&payload).ok()?;
        if let Some(map) = payload_value.as_object_mut() {
            map.remove("init_images");
        }
        self.save_stage_output(
            run_dir,
            StageOutput {
                name,
                stage: Stage::Adetailer,
                timestamp,
                prompt: &stage_prompt,
                negative_prompt: negative,
                original_negative_prompt: &adetailer.negative_prompt,
                payload: payload_value,
                source: Some(source.to_path_buf()),
                path,
                image,
            },
        )
    }

    /// Upscale stage for one image via the extras endpoint.
    async fn run_upscale(
        &self,
        prompt: &str,
        config: &AppConfig,
        run_dir: &Path,
        source: &Path,
        idx: usize,
    ) -> Option<StageResult> {
        let upscale = &config.upscale;
        let image_data = match self.artifacts.load_image_to_base64(source) {
            Ok(data) => data,
            Err(e) => {
                error!("could not read upscale input {:?}: {}", source, e);
                return None;
            }
        };
        let payload = UpscalePayload {
            image: image_data,
            resize_mode: upscale.resize_mode,
            upscaling_resize: upscale.upscaling_resize,
            upscaler_1: upscale.upscaler.clone(),
            upscaler_2: upscale.upscaler_2.clone(),
            extras_upscaler_2_visibility: upscale.extras_upscaler_2_visibility,
            gfpgan_visibility: upscale.gfpgan_visibility,
            codeformer_visibility: upscale.codeformer_visibility,
            codeformer_weight: upscale.codeformer_weight,
        };

        let response = self.client.upscale(&payload).await?;
        let timestamp = file_timestamp();
        let name = format!("{}_{}_{:03}", Stage::Upscale.tag(), timestamp, idx);
        let path = run_dir
            .join(Stage::Upscale.tag())
            .join(format!("{}.png", name));
        // The manifest drops the inline image payload to stay readable.
        let mut payload_value = serde_json::to_value(&payload).ok()?;
        if let Some(map) = payload_value.as_object_mut() {
            map.remove("image");
        }
        self.save_stage_output(
            run_dir,
            StageOutput {
                name,
                stage: Stage::Upscale,
                timestamp,
                prompt,
                negative_prompt: String::new(),
                original_negative_prompt: "",
                payload: payload_value,
                source: Some(source.to_path_buf()),
                path,
                image: &response.image,
            },
        )
    }

    fn save_stage_output(&self, run_dir: &Path, output: StageOutput<'_>) -> Option<StageResult> {
        if let Err(e) = self.artifacts.save_image_from_base64(&output.path, output.image) {
            error!("could not save {} output: {}", output.stage, e);
            return None;
        }
        let result = StageResult {
            name: output.name,
            stage: output.stage,
            timestamp: output.timestamp,
            prompt: output.prompt.to_string(),
            negative_prompt: output.negative_prompt,
            original_negative_prompt: output.original_negative_prompt.to_string(),
            request_payload: output.payload,
            source_image: output.source,
            output_path: output.path,
        };
        if let Err(e) = self.artifacts.save_manifest(run_dir, &result) {
            error!("could not write {} manifest: {}", output.stage, e);
        }
        Some(result)
    }
}

struct StageOutput<'a> {
    name: String,
    stage: Stage,
    timestamp: String,
    prompt: &'a str,
    negative_prompt: String,
    original_negative_prompt: &'a str,
    payload: serde_json::Value,
    source: Option<PathBuf>,
    path: PathBuf,
    image: &'a str,
}

/// Tracks completed work units and derives percent/ETA for callbacks.
struct ProgressTracker {
    total: usize,
    done: usize,
    started: Instant,
}

impl ProgressTracker {
    fn new(total: usize) -> Self {
        Self {
            total: total.max(1),
            done: 0,
            started: Instant::now(),
        }
    }

    fn complete_units(
        &mut self,
        callback: &Option<ProgressCallback>,
        stage: &str,
        units: usize,
    ) {
        self.done = (self.done + units).min(self.total);
        let Some(callback) = callback else { return };
        let percent = self.done as f64 / self.total as f64 * 100.0;
        let eta = if self.done == 0 || self.done >= self.total {
            "ETA: --".to_string()
        } else {
            let avg = self.started.elapsed().as_secs_f64() / self.done as f64;
            format_eta(avg * (self.total - self.done) as f64)
        };
        callback(ProgressUpdate {
            stage: stage.to_string(),
            percent,
            eta,
        });
    }
}

/// Extract a `name:` prefix from the first line of a prompt, sanitized for
/// filenames. Returns the prefix (if any) and the prompt without that line.
pub fn extract_name_prefix(prompt: &str) -> (Option<String>, String) {
    let mut lines = prompt.lines();
    let Some(first) = lines.next() else {
        return (None, prompt.to_string());
    };
    let trimmed = first.trim();
    if trimmed.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("name:")) {
        let raw = trimmed[5..].trim();
        if !raw.is_empty() {
            let remainder = lines.collect::<Vec<_>>().join("\n").trim().to_string();
            if !remainder.is_empty() {
                return (Some(sanitize_name(raw)), remainder);
            }
        }
    }
    (None, prompt.to_string())
}

fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Scheduler suffixes that legacy sampler strings may carry.
const SCHEDULER_SUFFIXES: [&str; 4] = ["Karras", "Exponential", "Polyexponential", "SGM Uniform"];

/// Split a legacy combined sampler string ("DPM++ 2M Karras") into sampler
/// and scheduler. Plain sampler names keep the configured scheduler, or
/// "Automatic" when none is set.
pub fn parse_sampler(sampler: &str, scheduler: &str) -> (String, String) {
    for suffix in SCHEDULER_SUFFIXES {
        if let Some(stripped) = sampler.strip_suffix(suffix) {
            let stripped = stripped.trim_end();
            if !stripped.is_empty() {
                return (stripped.to_string(), suffix.to_string());
            }
        }
    }
    let scheduler = if scheduler.is_empty() {
        "Automatic".to_string()
    } else {
        scheduler.to_string()
    };
    (sampler.to_string(), scheduler)
}

/// `ETA: MM:SS` under an hour, `ETA: Hh MMm SSs` above.
fn format_eta(remaining_secs: f64) -> String {
    let total = remaining_secs.round().max(0.0) as u64;
    if total < 3600 {
        format!("ETA: {:02}:{:02}", total / 60, total % 60)
    } else {
        format!(
            "ETA: {}h {:02}m {:02}s",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        )
    }
}
