//! # SD Pipeline
//!
//! Multi-stage Stable Diffusion WebUI pipeline orchestrator with prompt
//! randomization and cancellation support.
//!
//! This library drives a Stable Diffusion WebUI instance through a
//! generate → refine → upscale sequence, persisting every stage output with
//! a JSON manifest and aggregating a per-run CSV summary. Prompts can be
//! expanded into variants via search/replace rules, wildcard tokens, and
//! matrix combinations before a run starts.
//!
//! ## Features
//!
//! - **Staged execution** — txt2img, img2img refinement, an optional
//!   ADetailer detail pass, and extras upscaling chained per image, with
//!   failed middle stages skipped forward
//! - **Prompt randomization** — S/R rules, wildcards, and Cartesian matrix
//!   expansion with random, sequential, and rotating draw modes
//! - **Layered configuration** — defaults, named presets, per-pack
//!   overrides, and runtime parameters deep-merged in fixed order
//! - **Cooperative cancellation** — an `AtomicBool` token polled between
//!   every call and every saved image; partial results are kept
//! - **Run state machine** — validated Idle/Running/Stopping/Error
//!   transitions with synchronous callbacks
//! - **Video assembly** — stitch a run's frames into a video via FFmpeg
//!
//! ## Quick Start
//!
//! ```no_run
//! use sd_pipeline::{
//!     AppConfig, CancelToken, ConfigStore, Pipeline, RunArtifacts, SdWebUiClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SdWebUiClient::new("http://127.0.0.1:7860");
//!     let store = ConfigStore::new("presets");
//!     let config: AppConfig = store.resolve(Some("cinematic"), None, None)?;
//!
//!     let pipeline = Pipeline::new(client, store, RunArtifacts::new("output"));
//!     let token = CancelToken::new();
//!     let report = pipeline
//!         .run_full_pipeline("a castle at dusk", &config, None, 3, &token)
//!         .await?;
//!
//!     println!("final images: {}", report.summary.len());
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod pipeline;
pub mod randomizer;
pub mod state;
pub mod types;
pub mod video;

pub use artifacts::RunArtifacts;
pub use client::{GenerationApi, SdWebUiClient};
pub use config::{AppConfig, ConfigStore};
pub use controller::{LogLevel, LogMessage, PipelineController};
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
pub use randomizer::{PromptRandomizer, RandomizerConfig};
pub use state::{CancelToken, RunState, StateManager};
pub use types::{
    GenerationResponse, ProgressUpdate, PromptVariant, RunReport, RunSummary, Stage, StageResult,
};
pub use video::VideoAssembler;
