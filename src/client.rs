use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::types::{
    GenerationResponse, Img2ImgPayload, Txt2ImgPayload, UpscalePayload, UpscaleResponse,
};

fn normalize(base_url: String) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Seam between the orchestrator and the generation service.
///
/// Every method returns a failure sentinel (`None` / `false`) instead of an
/// error: transport failures, timeouts, and non-2xx statuses are logged at
/// this boundary and never propagate upward. No retries are attempted on
/// generation calls — a single failed call is a single failed stage.
#[allow(async_fn_in_trait)]
pub trait GenerationApi {
    async fn txt2img(&self, payload: &Txt2ImgPayload) -> Option<GenerationResponse>;
    async fn img2img(&self, payload: &Img2ImgPayload) -> Option<GenerationResponse>;
    async fn upscale(&self, payload: &UpscalePayload) -> Option<UpscaleResponse>;
    async fn set_model(&self, model_name: &str) -> bool;
    async fn set_vae(&self, vae_name: &str) -> bool;
}

/// A model checkpoint known to the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdModel {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub model_name: String,
}

/// An entry in the service's sampler or upscaler listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedEntry {
    #[serde(default)]
    pub name: String,
}

/// Async client for a Stable Diffusion WebUI instance (`/sdapi/v1/...`).
///
/// # Example
/// ```no_run
/// use sd_pipeline::SdWebUiClient;
/// use std::time::Duration;
///
/// # async fn example() {
/// let client = SdWebUiClient::new("http://127.0.0.1:7860");
/// let ready = client.check_ready(5, Duration::from_secs(2)).await;
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SdWebUiClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl SdWebUiClient {
    /// Create a new client with the default 300 s generation timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: normalize(base_url.into()),
            timeout: Duration::from_secs(300),
        }
    }

    /// Set the per-call timeout for generation requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a custom `reqwest::Client` (connection pooling, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ── Readiness ───────────────────────────────────────────────────

    /// Probe the models listing until the service answers 200, retrying a
    /// fixed number of times with a fixed delay between attempts.
    pub async fn check_ready(&self, max_retries: u32, retry_delay: Duration) -> bool {
        for attempt in 1..=max_retries {
            let url = format!("{}/sdapi/v1/sd-models", self.base_url);
            match self
                .http
                .get(&url)
                .timeout(Duration::from_secs(10))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!("generation service is ready at {}", self.base_url);
                    return true;
                }
                Ok(resp) => {
                    warn!(
                        "readiness probe {}/{} got HTTP {}",
                        attempt,
                        max_retries,
                        resp.status()
                    );
                }
                Err(e) => {
                    warn!("readiness probe {}/{} failed: {}", attempt, max_retries, e);
                }
            }
            if attempt < max_retries {
                tokio::time::sleep(retry_delay).await;
            }
        }
        error!("generation service not ready after {} attempts", max_retries);
        false
    }

    // ── Internal transport ──────────────────────────────────────────

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
        timeout: Duration,
    ) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {} from {}: {}", status, url, text);
        }
        Ok(resp.json().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP {} from {}", resp.status(), url);
        }
        Ok(resp.json().await?)
    }

    // ── Discovery ───────────────────────────────────────────────────

    /// List available model checkpoints. Empty on failure.
    pub async fn models(&self) -> Vec<SdModel> {
        match self.get_json("/sdapi/v1/sd-models").await {
            Ok(models) => models,
            Err(e) => {
                error!("failed to list models: {:#}", e);
                Vec::new()
            }
        }
    }

    /// List available VAE models. Empty on failure.
    pub async fn vae_models(&self) -> Vec<SdModel> {
        match self.get_json("/sdapi/v1/sd-vae").await {
            Ok(models) => models,
            Err(e) => {
                error!("failed to list VAE models: {:#}", e);
                Vec::new()
            }
        }
    }

    /// List available samplers. Empty on failure.
    pub async fn samplers(&self) -> Vec<NamedEntry> {
        match self.get_json("/sdapi/v1/samplers").await {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to list samplers: {:#}", e);
                Vec::new()
            }
        }
    }

    /// List available upscalers. Empty on failure.
    pub async fn upscalers(&self) -> Vec<NamedEntry> {
        match self.get_json("/sdapi/v1/upscalers").await {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to list upscalers: {:#}", e);
                Vec::new()
            }
        }
    }

    /// List available scheduler names, falling back to the common set when
    /// the endpoint is missing (older service versions).
    pub async fn schedulers(&self) -> Vec<String> {
        match self.get_json::<Vec<Value>>("/sdapi/v1/schedulers").await {
            Ok(entries) => entries
                .iter()
                .filter_map(|e| {
                    e.get("name")
                        .or_else(|| e.get("label"))
                        .and_then(|v| v.as_str())
                        .map(String::from)
                })
                .collect(),
            Err(e) => {
                warn!("failed to list schedulers, using fallback set: {:#}", e);
                [
                    "Normal",
                    "Karras",
                    "Exponential",
                    "SGM Uniform",
                    "Simple",
                    "DDIM Uniform",
                    "Beta",
                    "Linear",
                    "Cosine",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect()
            }
        }
    }

    /// The currently loaded model checkpoint, if the service reports one.
    pub async fn current_model(&self) -> Option<String> {
        match self.get_json::<Value>("/sdapi/v1/options").await {
            Ok(options) => options
                .get("sd_model_checkpoint")
                .and_then(|v| v.as_str())
                .map(String::from),
            Err(e) => {
                error!("failed to read current model: {:#}", e);
                None
            }
        }
    }
}

impl GenerationApi for SdWebUiClient {
    async fn txt2img(&self, payload: &Txt2ImgPayload) -> Option<GenerationResponse> {
        match self
            .post_json::<GenerationResponse>("/sdapi/v1/txt2img", payload, self.timeout)
            .await
        {
            Ok(resp) => {
                info!("txt2img completed, {} image(s) returned", resp.images.len());
                Some(resp)
            }
            Err(e) => {
                error!("txt2img request failed: {:#}", e);
                None
            }
        }
    }

    async fn img2img(&self, payload: &Img2ImgPayload) -> Option<GenerationResponse> {
        match self
            .post_json::<GenerationResponse>("/sdapi/v1/img2img", payload, self.timeout)
            .await
        {
            Ok(resp) => {
                info!("img2img completed, {} image(s) returned", resp.images.len());
                Some(resp)
            }
            Err(e) => {
                error!("img2img request failed: {:#}", e);
                None
            }
        }
    }

    async fn upscale(&self, payload: &UpscalePayload) -> Option<UpscaleResponse> {
        match self
            .post_json::<UpscaleResponse>("/sdapi/v1/extra-single-image", payload, self.timeout)
            .await
        {
            Ok(resp) => {
                info!("upscale completed with {}", payload.upscaler_1);
                Some(resp)
            }
            Err(e) => {
                error!("upscale request failed: {:#}", e);
                None
            }
        }
    }

    async fn set_model(&self, model_name: &str) -> bool {
        let body = json!({ "sd_model_checkpoint": model_name });
        // Model switching can take a while server-side.
        match self
            .post_json::<Value>("/sdapi/v1/options", &body, Duration::from_secs(30))
            .await
        {
            Ok(_) => {
                info!("set model to {}", model_name);
                true
            }
            Err(e) => {
                error!("failed to set model '{}': {:#}", model_name, e);
                false
            }
        }
    }

    async fn set_vae(&self, vae_name: &str) -> bool {
        let body = json!({ "sd_vae": vae_name });
        match self
            .post_json::<Value>("/sdapi/v1/options", &body, Duration::from_secs(10))
            .await
        {
            Ok(_) => {
                info!("set VAE to {}", vae_name);
                true
            }
            Err(e) => {
                error!("failed to set VAE '{}': {:#}", vae_name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize("http://localhost:7860/".into()),
            "http://localhost:7860"
        );
        assert_eq!(
            normalize("http://localhost:7860".into()),
            "http://localhost:7860"
        );
        assert_eq!(normalize("http://host:7860///".into()), "http://host:7860");
    }

    #[test]
    fn test_client_builder() {
        let client =
            SdWebUiClient::new("http://127.0.0.1:7860/").with_timeout(Duration::from_secs(60));
        assert_eq!(client.base_url(), "http://127.0.0.1:7860");
        assert_eq!(client.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_model_listing() {
        let models: Vec<SdModel> = serde_json::from_str(
            r#"[
                {"title": "dreamshaper_8.safetensors [abc]", "model_name": "dreamshaper_8"},
                {"title": "deliberate_v3.safetensors [def]", "model_name": "deliberate_v3"}
            ]"#,
        )
        .unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].model_name, "dreamshaper_8");
    }

    #[test]
    fn test_parse_scheduler_listing() {
        let entries: Vec<Value> = serde_json::from_str(
            r#"[{"name": "karras", "label": "Karras"}, {"label": "Normal"}]"#,
        )
        .unwrap();
        let names: Vec<String> = entries
            .iter()
            .filter_map(|e| {
                e.get("name")
                    .or_else(|| e.get("label"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
            })
            .collect();
        assert_eq!(names, vec!["karras", "Normal"]);
    }
}
