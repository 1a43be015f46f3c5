use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use sd_pipeline::client::GenerationApi;
use sd_pipeline::randomizer::{DrawMode, MatrixConfig, MatrixMode, MatrixSlot, SrConfig, SrRule};
use sd_pipeline::types::{
    GenerationResponse, Img2ImgPayload, ProgressUpdate, Txt2ImgPayload, UpscalePayload,
    UpscaleResponse,
};
use sd_pipeline::{
    AppConfig, CancelToken, ConfigStore, Pipeline, PipelineController, PipelineError,
    PromptRandomizer, RandomizerConfig, RunArtifacts, Stage,
};

#[derive(Default)]
struct CallLog {
    txt2img: Vec<Txt2ImgPayload>,
    img2img: Vec<Img2ImgPayload>,
    upscale: Vec<UpscalePayload>,
}

/// Scriptable stand-in for the generation service.
#[derive(Clone)]
struct MockClient {
    log: Arc<Mutex<CallLog>>,
    images_per_call: usize,
    fail_txt2img: bool,
    fail_img2img: bool,
    fail_upscale: bool,
    /// Cancels this token from inside the txt2img call, simulating a stop
    /// request that lands while a batch response is being persisted.
    cancel_on_txt2img: Option<CancelToken>,
}

impl MockClient {
    fn new(images_per_call: usize) -> Self {
        Self {
            log: Arc::new(Mutex::new(CallLog::default())),
            images_per_call,
            fail_txt2img: false,
            fail_img2img: false,
            fail_upscale: false,
            cancel_on_txt2img: None,
        }
    }

    fn image(tag: &str, idx: usize) -> String {
        BASE64.encode(format!("{}-{}", tag, idx))
    }
}

impl GenerationApi for MockClient {
    async fn txt2img(&self, payload: &Txt2ImgPayload) -> Option<GenerationResponse> {
        self.log.lock().unwrap().txt2img.push(payload.clone());
        if self.fail_txt2img {
            return None;
        }
        if let Some(token) = &self.cancel_on_txt2img {
            token.cancel();
        }
        Some(GenerationResponse {
            images: (0..self.images_per_call)
                .map(|i| Self::image("gen", i))
                .collect(),
        })
    }

    async fn img2img(&self, payload: &Img2ImgPayload) -> Option<GenerationResponse> {
        self.log.lock().unwrap().img2img.push(payload.clone());
        if self.fail_img2img {
            return None;
        }
        Some(GenerationResponse {
            images: vec![Self::image("refine", 0)],
        })
    }

    async fn upscale(&self, payload: &UpscalePayload) -> Option<UpscaleResponse> {
        self.log.lock().unwrap().upscale.push(payload.clone());
        if self.fail_upscale {
            return None;
        }
        Some(UpscaleResponse {
            image: Self::image("upscale", 0),
        })
    }

    async fn set_model(&self, _model_name: &str) -> bool {
        true
    }

    async fn set_vae(&self, _vae_name: &str) -> bool {
        true
    }
}

fn harness(client: MockClient) -> (Pipeline<MockClient>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("presets"));
    let artifacts = RunArtifacts::new(dir.path().join("output"));
    (Pipeline::new(client, store, artifacts), dir)
}

#[tokio::test]
async fn full_pipeline_runs_all_enabled_stages() {
    let client = MockClient::new(1);
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);
    let config = AppConfig::default();
    let token = CancelToken::new();

    let report = pipeline
        .run_full_pipeline("a castle at dusk", &config, Some("run1"), 1, &token)
        .await
        .unwrap();

    assert_eq!(report.generate.len(), 1);
    assert_eq!(report.refine.len(), 1);
    assert_eq!(report.upscale.len(), 1);
    assert_eq!(report.summary.len(), 1);
    let summary = &report.summary[0];
    assert_eq!(
        summary.stages_completed,
        vec![Stage::Generate, Stage::Refine, Stage::Upscale]
    );
    assert_eq!(summary.final_image_path, report.upscale[0].output_path);
    assert!(summary.final_image_path.exists());

    let log = log.lock().unwrap();
    assert_eq!(log.txt2img.len(), 1);
    assert_eq!(log.img2img.len(), 1);
    assert_eq!(log.upscale.len(), 1);
    // Refine consumed the generate output.
    assert_eq!(
        log.img2img[0].init_images[0],
        BASE64.encode(fs::read(&report.generate[0].output_path).unwrap())
    );
}

#[tokio::test]
async fn generate_only_when_other_stages_disabled() {
    let client = MockClient::new(1);
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);
    let mut config = AppConfig::default();
    config.pipeline.refine_enabled = false;
    config.pipeline.upscale_enabled = false;

    let report = pipeline
        .run_full_pipeline("a castle", &config, None, 1, &CancelToken::new())
        .await
        .unwrap();

    let summary = &report.summary[0];
    assert_eq!(summary.stages_completed, vec![Stage::Generate]);
    assert_eq!(summary.final_image_path, summary.generate_path);
    assert!(summary.refine_path.is_none());
    assert!(summary.upscale_path.is_none());
    let log = log.lock().unwrap();
    assert!(log.img2img.is_empty());
    assert!(log.upscale.is_empty());
}

#[tokio::test]
async fn failed_refine_skips_forward_to_upscale() {
    let mut client = MockClient::new(1);
    client.fail_img2img = true;
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);
    let config = AppConfig::default();

    let report = pipeline
        .run_full_pipeline("a castle", &config, None, 1, &CancelToken::new())
        .await
        .unwrap();

    let summary = &report.summary[0];
    assert_eq!(summary.stages_completed, vec![Stage::Generate, Stage::Upscale]);
    assert!(summary.refine_path.is_none());
    assert_eq!(report.refine.len(), 0);
    // Upscale fell back to the generate-stage output.
    assert_eq!(
        report.upscale[0].source_image.as_ref().unwrap(),
        &report.generate[0].output_path
    );
    let log = log.lock().unwrap();
    assert_eq!(
        log.upscale[0].image,
        BASE64.encode(fs::read(&report.generate[0].output_path).unwrap())
    );
}

#[tokio::test]
async fn failed_upscale_keeps_refine_as_final_image() {
    let mut client = MockClient::new(1);
    client.fail_upscale = true;
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);
    let config = AppConfig::default();

    let report = pipeline
        .run_full_pipeline("a castle", &config, None, 1, &CancelToken::new())
        .await
        .unwrap();

    let summary = &report.summary[0];
    assert_eq!(summary.stages_completed, vec![Stage::Generate, Stage::Refine]);
    assert!(summary.upscale_path.is_none());
    assert_eq!(report.upscale.len(), 0);
    // The last successful stage wins.
    assert_eq!(summary.final_image_path, summary.refine_path.clone().unwrap());
    assert_eq!(summary.final_image_path, report.refine[0].output_path);
    let log = log.lock().unwrap();
    assert_eq!(log.upscale.len(), 1);
}

#[tokio::test]
async fn failed_generate_is_a_run_error() {
    let mut client = MockClient::new(1);
    client.fail_txt2img = true;
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);

    let err = pipeline
        .run_full_pipeline("a castle", &AppConfig::default(), None, 1, &CancelToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::StageFailed { ref stage, .. } if stage == "generate"
    ));
    // No downstream stage was attempted.
    let log = log.lock().unwrap();
    assert_eq!(log.txt2img.len(), 1);
    assert!(log.img2img.is_empty());
    assert!(log.upscale.is_empty());
}

#[tokio::test]
async fn adetailer_stage_runs_between_refine_and_upscale() {
    let client = MockClient::new(1);
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);
    let mut config = AppConfig::default();
    config.pipeline.refine_enabled = false;
    config.pipeline.upscale_enabled = false;
    config.pipeline.adetailer_enabled = true;

    let report = pipeline
        .run_full_pipeline("a portrait", &config, None, 1, &CancelToken::new())
        .await
        .unwrap();

    let summary = &report.summary[0];
    assert_eq!(summary.stages_completed, vec![Stage::Generate, Stage::Adetailer]);
    assert_eq!(report.adetailer.len(), 1);
    assert_eq!(summary.final_image_path, report.adetailer[0].output_path);
    assert!(summary.final_image_path.exists());
    assert!(summary
        .adetailer_path
        .as_ref()
        .unwrap()
        .to_string_lossy()
        .contains("adetailer"));

    let log = log.lock().unwrap();
    assert_eq!(log.img2img.len(), 1);
    // The detail pass rides on img2img via the extension's script block.
    let scripts = log.img2img[0].alwayson_scripts.as_ref().unwrap();
    let args = &scripts["ADetailer"]["args"][0];
    assert_eq!(args["ad_model"], "face_yolov8n.pt");
    assert_eq!(args["ad_inpaint_only_masked"], true);
}

#[tokio::test]
async fn failed_adetailer_falls_back_to_prior_output() {
    let mut client = MockClient::new(1);
    client.fail_img2img = true;
    let (pipeline, _dir) = harness(client);
    let mut config = AppConfig::default();
    config.pipeline.refine_enabled = false;
    config.pipeline.upscale_enabled = false;
    config.pipeline.adetailer_enabled = true;

    let report = pipeline
        .run_full_pipeline("a portrait", &config, None, 1, &CancelToken::new())
        .await
        .unwrap();

    let summary = &report.summary[0];
    assert_eq!(summary.stages_completed, vec![Stage::Generate]);
    assert!(summary.adetailer_path.is_none());
    assert_eq!(summary.final_image_path, summary.generate_path);
}

#[tokio::test]
async fn pre_run_cancel_makes_zero_calls() {
    let client = MockClient::new(1);
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);
    let token = CancelToken::new();
    token.cancel();

    let report = pipeline
        .run_full_pipeline("a castle", &AppConfig::default(), None, 3, &token)
        .await
        .unwrap();

    assert!(report.generate.is_empty());
    assert!(report.summary.is_empty());
    let log = log.lock().unwrap();
    assert!(log.txt2img.is_empty());
    assert!(log.img2img.is_empty());
    assert!(log.upscale.is_empty());
}

#[tokio::test]
async fn mid_batch_cancel_keeps_saved_images_only() {
    let token = CancelToken::new();
    let mut client = MockClient::new(3);
    client.cancel_on_txt2img = Some(token.clone());
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);

    let report = pipeline
        .run_full_pipeline("a castle", &AppConfig::default(), None, 3, &token)
        .await
        .unwrap();

    // The cancel landed before the post-save check of the first image, so
    // exactly one image is kept and no downstream stage runs.
    assert_eq!(report.generate.len(), 1);
    assert!(report.generate[0].output_path.exists());
    assert_eq!(report.summary.len(), 1);
    assert_eq!(report.summary[0].stages_completed, vec![Stage::Generate]);
    let log = log.lock().unwrap();
    assert!(log.img2img.is_empty());
    assert!(log.upscale.is_empty());
}

#[tokio::test]
async fn batch_of_three_writes_three_manifests_and_csv_rows() {
    let client = MockClient::new(3);
    let (pipeline, _dir) = harness(client);
    let mut config = AppConfig::default();
    config.pipeline.refine_enabled = false;
    config.pipeline.upscale_enabled = false;

    let report = pipeline
        .run_full_pipeline("a castle", &config, Some("batch3"), 3, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.generate.len(), 3);
    assert!(report.generate.iter().all(|r| r.stage == Stage::Generate));

    let manifests: Vec<PathBuf> = fs::read_dir(report.run_dir.join("manifests"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(manifests.len(), 3);

    let csv = fs::read_to_string(report.run_dir.join("summary.csv")).unwrap();
    assert_eq!(csv.lines().count(), 4); // header + one row per image
}

#[tokio::test]
async fn safety_suffix_applied_once_per_stage_call() {
    let client = MockClient::new(1);
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);
    let mut config = AppConfig::default();
    config.generate.negative_prompt = "blurry".into();
    config.pipeline.upscale_enabled = false;

    pipeline
        .run_full_pipeline("a castle", &config, None, 1, &CancelToken::new())
        .await
        .unwrap();

    let log = log.lock().unwrap();
    let negative = &log.txt2img[0].negative_prompt;
    assert!(negative.starts_with("blurry, "));
    assert!(negative.contains("nsfw"));
    assert_eq!(negative.matches("nsfw").count(), 1);
    // The refine call augments its own configured negative independently.
    assert_eq!(log.img2img[0].negative_prompt.matches("nsfw").count(), 1);
}

#[tokio::test]
async fn name_prefix_drives_generate_filenames() {
    let client = MockClient::new(1);
    let (pipeline, _dir) = harness(client);
    let mut config = AppConfig::default();
    config.pipeline.refine_enabled = false;
    config.pipeline.upscale_enabled = false;

    let report = pipeline
        .run_full_pipeline(
            "name: Red Castle\na red castle on a cliff",
            &config,
            None,
            1,
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.prompt, "a red castle on a cliff");
    assert!(report.generate[0].name.starts_with("Red_Castle_"));
}

#[tokio::test]
async fn randomized_variants_each_run_separately() {
    let randomizer_config = RandomizerConfig {
        enabled: true,
        prompt_sr: SrConfig {
            enabled: true,
            mode: DrawMode::Sequential,
            rules: vec![SrRule {
                search: "castle".into(),
                replacements: vec!["fortress".into(), "palace".into()],
            }],
        },
        matrix: MatrixConfig {
            enabled: true,
            mode: MatrixMode::Fanout,
            slots: vec![MatrixSlot {
                name: "time".into(),
                values: vec!["dawn".into(), "dusk".into()],
            }],
            ..Default::default()
        },
        ..Default::default()
    };
    let mut randomizer = PromptRandomizer::with_seed(&randomizer_config, 7);
    let variants = randomizer.generate("a castle at [[time]]");
    assert_eq!(variants.len(), 2);

    let client = MockClient::new(1);
    let log = Arc::clone(&client.log);
    let (pipeline, _dir) = harness(client);
    let mut config = AppConfig::default();
    config.pipeline.refine_enabled = false;
    config.pipeline.upscale_enabled = false;

    for (idx, variant) in variants.iter().enumerate() {
        let report = pipeline
            .run_full_pipeline(
                &variant.text,
                &config,
                Some(&format!("variant_{}", idx)),
                1,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.summary.len(), 1);
    }

    let log = log.lock().unwrap();
    assert_eq!(log.txt2img[0].prompt, "a fortress at dawn");
    assert_eq!(log.txt2img[1].prompt, "a fortress at dusk");
}

#[tokio::test]
async fn progress_updates_reach_one_hundred_percent() {
    let client = MockClient::new(2);
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("presets"));
    let artifacts = RunArtifacts::new(dir.path().join("output"));
    let updates: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    let pipeline = Pipeline::new(client, store, artifacts)
        .with_progress(move |update| sink.lock().unwrap().push(update));

    let report = pipeline
        .run_full_pipeline("a castle", &AppConfig::default(), None, 2, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.summary.len(), 2);

    let updates = updates.lock().unwrap();
    assert!(!updates.is_empty());
    assert_eq!(updates[0].stage, "generate");
    assert_eq!(updates.last().unwrap().percent, 100.0);
}

#[tokio::test]
async fn controller_drives_a_pipeline_run_to_completion() {
    let client = MockClient::new(1);
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("presets"));
    let artifacts = RunArtifacts::new(dir.path().join("output"));
    let controller = PipelineController::new();

    let accepted = controller.start(move |token| async move {
        let pipeline = Pipeline::new(client, store, artifacts);
        pipeline
            .run_full_pipeline("a castle", &AppConfig::default(), None, 1, &token)
            .await
    });
    assert!(accepted);

    // The worker flips back to Idle once the run completes.
    for _ in 0..100 {
        if !controller.is_running() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let report = controller.take_result().unwrap().unwrap();
    assert_eq!(report.summary.len(), 1);
}
