use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::randomizer::RandomizerConfig;

/// Safety terms appended to every negative prompt, not configurable.
const SAFETY_NEGATIVE_TERMS: &str = "nsfw, nude, naked, explicit, sexual content, \
adult content, inappropriate, offensive, disturbing, violent, graphic";

/// Settings for the generate (txt2img) stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    pub steps: u32,
    pub sampler_name: String,
    pub scheduler: String,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub negative_prompt: String,
    /// -1 for a service-chosen random seed.
    pub seed: i64,
    pub seed_resize_from_h: i64,
    pub seed_resize_from_w: i64,
    pub clip_skip: u32,
    pub n_iter: u32,
    pub restore_faces: bool,
    pub tiling: bool,
    pub do_not_save_samples: bool,
    pub do_not_save_grid: bool,
    pub enable_hr: bool,
    pub hr_scale: f64,
    pub hr_upscaler: String,
    /// 0 = reuse `steps` for the second pass.
    pub hr_second_pass_steps: u32,
    pub hr_resize_x: u32,
    pub hr_resize_y: u32,
    /// Denoising for the hires-fix second pass.
    pub denoising_strength: f64,
    /// Model checkpoint; empty = keep the service's current one.
    pub model: String,
    /// VAE; empty = model default.
    pub vae: String,
    pub styles: Vec<String>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            steps: 20,
            sampler_name: "Euler a".into(),
            scheduler: "Normal".into(),
            cfg_scale: 7.0,
            width: 512,
            height: 512,
            negative_prompt: "blurry, bad quality, distorted".into(),
            seed: -1,
            seed_resize_from_h: -1,
            seed_resize_from_w: -1,
            clip_skip: 2,
            n_iter: 1,
            restore_faces: false,
            tiling: false,
            do_not_save_samples: false,
            do_not_save_grid: false,
            enable_hr: false,
            hr_scale: 2.0,
            hr_upscaler: "Latent".into(),
            hr_second_pass_steps: 0,
            hr_resize_x: 0,
            hr_resize_y: 0,
            denoising_strength: 0.7,
            model: String::new(),
            vae: String::new(),
            styles: Vec::new(),
        }
    }
}

/// Settings for the refine (img2img) stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub steps: u32,
    pub sampler_name: String,
    pub scheduler: String,
    pub cfg_scale: f64,
    pub denoising_strength: f64,
    pub width: u32,
    pub height: u32,
    pub negative_prompt: String,
    pub seed: i64,
    pub clip_skip: u32,
    pub model: String,
    pub vae: String,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            steps: 15,
            sampler_name: "Euler a".into(),
            scheduler: "Normal".into(),
            cfg_scale: 7.0,
            denoising_strength: 0.3,
            width: 512,
            height: 512,
            negative_prompt: String::new(),
            seed: -1,
            clip_skip: 2,
            model: String::new(),
            vae: String::new(),
        }
    }
}

/// Settings for the ADetailer face/detail enhancement stage (img2img with
/// the ADetailer extension's `alwayson_scripts` payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdetailerConfig {
    /// Detail prompt; empty = reuse the run prompt.
    pub prompt: String,
    pub negative_prompt: String,
    pub sampler_name: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub denoising_strength: f64,
    /// Detection model shipped with the extension.
    pub model: String,
    pub confidence: f64,
    pub mask_feather: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for AdetailerConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            sampler_name: "DPM++ 2M".into(),
            steps: 28,
            cfg_scale: 7.0,
            denoising_strength: 0.4,
            model: "face_yolov8n.pt".into(),
            confidence: 0.3,
            mask_feather: 4,
            width: 512,
            height: 512,
        }
    }
}

/// Settings for the upscale (extras) stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleConfig {
    pub upscaler: String,
    pub upscaler_2: String,
    pub extras_upscaler_2_visibility: f64,
    pub upscaling_resize: f64,
    pub resize_mode: u32,
    pub gfpgan_visibility: f64,
    pub codeformer_visibility: f64,
    pub codeformer_weight: f64,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            upscaler: "R-ESRGAN 4x+".into(),
            upscaler_2: "None".into(),
            extras_upscaler_2_visibility: 0.0,
            upscaling_resize: 2.0,
            resize_mode: 0,
            gfpgan_visibility: 0.0,
            codeformer_visibility: 0.0,
            codeformer_weight: 0.5,
        }
    }
}

/// Which optional stages run. Generate always runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineToggles {
    pub refine_enabled: bool,
    /// Off by default: requires the ADetailer extension server-side.
    pub adetailer_enabled: bool,
    pub upscale_enabled: bool,
}

impl Default for PipelineToggles {
    fn default() -> Self {
        Self {
            refine_enabled: true,
            adetailer_enabled: false,
            upscale_enabled: true,
        }
    }
}

/// Generation service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860".into(),
            timeout_secs: 300,
        }
    }
}

/// Video assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub fps: u32,
    pub codec: String,
    pub quality: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: 24,
            codec: "libx264".into(),
            quality: "medium".into(),
        }
    }
}

/// The fully resolved configuration for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub generate: GenerateConfig,
    pub refine: RefineConfig,
    pub adetailer: AdetailerConfig,
    pub upscale: UpscaleConfig,
    pub pipeline: PipelineToggles,
    pub randomization: RandomizerConfig,
    pub video: VideoConfig,
    pub api: ApiConfig,
}

/// Loads presets and pack overrides from disk and resolves the layered
/// configuration: defaults → preset → pack override → runtime parameters.
///
/// Explicitly constructed and passed to whatever needs it — there is no
/// process-wide singleton, so isolated runs can use isolated stores.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    presets_dir: PathBuf,
    packs_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(presets_dir: impl Into<PathBuf>) -> Self {
        let presets_dir = presets_dir.into();
        if let Err(e) = fs::create_dir_all(&presets_dir) {
            warn!("failed to create presets dir {:?}: {}", presets_dir, e);
        }
        Self {
            presets_dir,
            packs_dir: PathBuf::from("packs"),
        }
    }

    pub fn with_packs_dir(mut self, packs_dir: impl Into<PathBuf>) -> Self {
        self.packs_dir = packs_dir.into();
        self
    }

    // ── Presets ─────────────────────────────────────────────────────

    /// Load a named preset. A missing preset is recoverable: the caller
    /// falls back to defaults.
    pub fn load_preset(&self, name: &str) -> Option<Value> {
        let path = self.presets_dir.join(format!("{}.json", name));
        if !path.exists() {
            warn!("preset '{}' not found at {:?}", name, path);
            return None;
        }
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => {
                    info!("loaded preset '{}'", name);
                    Some(value)
                }
                Err(e) => {
                    error!("preset '{}' is not valid JSON: {}", name, e);
                    None
                }
            },
            Err(e) => {
                error!("failed to read preset '{}': {}", name, e);
                None
            }
        }
    }

    pub fn save_preset(&self, name: &str, config: &Value) -> bool {
        let path = self.presets_dir.join(format!("{}.json", name));
        match serde_json::to_string_pretty(config)
            .map_err(anyhow::Error::from)
            .and_then(|text| fs::write(&path, text).map_err(Into::into))
        {
            Ok(()) => {
                info!("saved preset '{}'", name);
                true
            }
            Err(e) => {
                error!("failed to save preset '{}': {:#}", name, e);
                false
            }
        }
    }

    /// Names of all presets on disk, sorted.
    pub fn list_presets(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.presets_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                    .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    // ── Pack configuration ──────────────────────────────────────────

    /// Per-pack configuration from `packs/<stem>.json`. A pack name may
    /// carry its prompt-file extension ("heroes.txt" → "heroes.json").
    pub fn pack_config(&self, pack_name: &str) -> Option<Value> {
        let stem = Path::new(pack_name).file_stem()?.to_string_lossy();
        let path = self.packs_dir.join(format!("{}.json", stem));
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => {
                    debug!("loaded pack config '{}'", pack_name);
                    Some(value)
                }
                Err(e) => {
                    error!("pack config '{}' is not valid JSON: {}", pack_name, e);
                    None
                }
            },
            Err(e) => {
                error!("failed to read pack config '{}': {}", pack_name, e);
                None
            }
        }
    }

    pub fn save_pack_config(&self, pack_name: &str, config: &Value) -> bool {
        let Some(stem) = Path::new(pack_name).file_stem() else {
            error!("invalid pack name '{}'", pack_name);
            return false;
        };
        let path = self.packs_dir.join(format!("{}.json", stem.to_string_lossy()));
        if let Err(e) = fs::create_dir_all(&self.packs_dir) {
            error!("failed to create packs dir {:?}: {}", self.packs_dir, e);
            return false;
        }
        match serde_json::to_string_pretty(config)
            .map_err(anyhow::Error::from)
            .and_then(|text| fs::write(&path, text).map_err(Into::into))
        {
            Ok(()) => {
                info!("saved pack config '{}'", pack_name);
                true
            }
            Err(e) => {
                error!("failed to save pack config '{}': {:#}", pack_name, e);
                false
            }
        }
    }

    /// Pack config, created from the named preset if absent.
    pub fn ensure_pack_config(&self, pack_name: &str, preset_name: &str) -> Option<Value> {
        if let Some(config) = self.pack_config(pack_name) {
            return Some(config);
        }
        let preset = self.load_preset(preset_name)?;
        if self.save_pack_config(pack_name, &preset) {
            info!(
                "created pack config for '{}' from preset '{}'",
                pack_name, preset_name
            );
        }
        Some(preset)
    }

    /// Per-pack entry from the shared `pack_overrides.json` map.
    pub fn pack_overrides(&self, pack_name: &str) -> Option<Value> {
        let path = self.presets_dir.join("pack_overrides.json");
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<Value>(&text).map_err(Into::into))
        {
            Ok(all) => all.get(pack_name).cloned(),
            Err(e) => {
                error!("failed to load pack overrides: {:#}", e);
                None
            }
        }
    }

    pub fn save_pack_overrides(&self, pack_name: &str, overrides: &Value) -> bool {
        let path = self.presets_dir.join("pack_overrides.json");
        let mut all = if path.exists() {
            fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<Value>(&text).ok())
                .unwrap_or_else(|| Value::Object(Default::default()))
        } else {
            Value::Object(Default::default())
        };
        if let Some(map) = all.as_object_mut() {
            map.insert(pack_name.to_string(), overrides.clone());
        }
        match serde_json::to_string_pretty(&all)
            .map_err(anyhow::Error::from)
            .and_then(|text| fs::write(&path, text).map_err(Into::into))
        {
            Ok(()) => {
                info!("saved pack overrides for '{}'", pack_name);
                true
            }
            Err(e) => {
                error!("failed to save pack overrides: {:#}", e);
                false
            }
        }
    }

    // ── Resolution ──────────────────────────────────────────────────

    /// Resolve the layered configuration into one flat settings object.
    ///
    /// Layers are deep-merged in fixed order: built-in defaults, then the
    /// named preset, then pack overrides, then runtime parameters. Nested
    /// maps merge key-wise, scalars overwrite, and a provided list replaces
    /// the base list entirely.
    pub fn resolve(
        &self,
        preset_name: Option<&str>,
        pack_overrides: Option<&Value>,
        runtime_params: Option<&Value>,
    ) -> Result<AppConfig> {
        let mut merged = serde_json::to_value(AppConfig::default())?;

        if let Some(name) = preset_name {
            if let Some(preset) = self.load_preset(name) {
                deep_merge(&mut merged, &preset);
            }
        }
        if let Some(overrides) = pack_overrides {
            deep_merge(&mut merged, overrides);
        }
        if let Some(params) = runtime_params {
            deep_merge(&mut merged, params);
        }

        serde_json::from_value(merged)
            .map_err(|e| PipelineError::InvalidConfig(format!("merged config is invalid: {}", e)))
    }

    /// Append the fixed safety term list to a negative prompt.
    ///
    /// Not idempotent: calling it on an already-augmented string appends
    /// the suffix again. Stage code applies it exactly once per invocation.
    pub fn add_safety_suffix(&self, negative_prompt: &str) -> String {
        if negative_prompt.is_empty() {
            SAFETY_NEGATIVE_TERMS.to_string()
        } else {
            format!("{}, {}", negative_prompt, SAFETY_NEGATIVE_TERMS)
        }
    }
}

/// Key-wise recursive merge of `overlay` into `base`. Objects recurse;
/// scalars and arrays in the overlay replace the base value.
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.generate.steps, 20);
        assert_eq!(config.generate.sampler_name, "Euler a");
        assert_eq!(config.refine.denoising_strength, 0.3);
        assert_eq!(config.upscale.upscaler, "R-ESRGAN 4x+");
        assert_eq!(config.adetailer.model, "face_yolov8n.pt");
        assert_eq!(config.adetailer.steps, 28);
        assert!(config.pipeline.refine_enabled);
        assert!(!config.pipeline.adetailer_enabled);
        assert!(config.pipeline.upscale_enabled);
        assert_eq!(config.api.base_url, "http://127.0.0.1:7860");
    }

    #[test]
    fn test_deep_merge_scalars_and_nested() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let overlay = json!({"a": 9, "nested": {"y": 5}, "extra": true});
        deep_merge(&mut base, &overlay);
        assert_eq!(base, json!({"a": 9, "nested": {"x": 1, "y": 5}, "extra": true}));
    }

    #[test]
    fn test_deep_merge_replaces_lists() {
        let mut base = json!({"styles": ["a", "b", "c"]});
        let overlay = json!({"styles": ["d"]});
        deep_merge(&mut base, &overlay);
        assert_eq!(base, json!({"styles": ["d"]}));
    }

    #[test]
    fn test_resolve_layer_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save_preset("cinematic", &json!({"generate": {"steps": 30, "cfg_scale": 8.0}}));

        let pack = json!({"generate": {"steps": 40}});
        let runtime = json!({"generate": {"width": 768}});
        let config = store
            .resolve(Some("cinematic"), Some(&pack), Some(&runtime))
            .unwrap();

        // Pack override wins over preset, runtime wins over both; untouched
        // fields come from the preceding layers.
        assert_eq!(config.generate.steps, 40);
        assert_eq!(config.generate.cfg_scale, 8.0);
        assert_eq!(config.generate.width, 768);
        assert_eq!(config.generate.height, 512);
    }

    #[test]
    fn test_resolve_missing_preset_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.load_preset("nope").is_none());
        let config = store.resolve(Some("nope"), None, None).unwrap();
        assert_eq!(config.generate.steps, 20);
    }

    #[test]
    fn test_list_presets_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save_preset("zeta", &json!({}));
        store.save_preset("alpha", &json!({}));
        assert_eq!(store.list_presets(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_pack_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("presets"))
            .with_packs_dir(dir.path().join("packs"));
        assert!(store.pack_config("heroes.txt").is_none());
        assert!(store.save_pack_config("heroes.txt", &json!({"generate": {"steps": 25}})));
        let config = store.pack_config("heroes.txt").unwrap();
        assert_eq!(config["generate"]["steps"], 25);
    }

    #[test]
    fn test_pack_overrides_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.pack_overrides("heroes").is_none());
        assert!(store.save_pack_overrides("heroes", &json!({"generate": {"steps": 12}})));
        let overrides = store.pack_overrides("heroes").unwrap();
        assert_eq!(overrides["generate"]["steps"], 12);
        assert!(store.pack_overrides("villains").is_none());
    }

    #[test]
    fn test_safety_suffix_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let augmented = store.add_safety_suffix("blurry");
        assert!(augmented.starts_with("blurry, "));
        assert!(augmented.contains("nsfw"));
        assert!(augmented.contains("graphic"));
    }

    #[test]
    fn test_safety_suffix_on_empty_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let augmented = store.add_safety_suffix("");
        assert!(augmented.starts_with("nsfw"));
        assert!(!augmented.starts_with(", "));
    }

    #[test]
    fn test_safety_suffix_not_idempotent() {
        // Double application duplicates the suffix; stage code therefore
        // applies it exactly once per invocation.
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let once = store.add_safety_suffix("blurry");
        let twice = store.add_safety_suffix(&once);
        assert_eq!(twice.matches("nsfw").count(), 2);
    }
}
