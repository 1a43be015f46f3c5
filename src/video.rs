use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::config::VideoConfig;

type SharedChild = Arc<tokio::sync::Mutex<Option<Child>>>;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stitches a run's images into a video by shelling out to FFmpeg.
///
/// The spawned child is registered in the controller's shared subprocess
/// slot so a stop request can terminate an in-flight encode. Failures are
/// logged and reported as `false`, never raised.
pub struct VideoAssembler {
    subprocess: SharedChild,
}

impl VideoAssembler {
    pub fn new(subprocess: SharedChild) -> Self {
        Self { subprocess }
    }

    /// Whether an `ffmpeg` binary answers on this system.
    pub async fn probe() -> bool {
        let mut check = Command::new("ffmpeg");
        check
            .arg("-version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        match tokio::time::timeout(PROBE_TIMEOUT, check.status()).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                warn!("ffmpeg probe exited with {}", status);
                false
            }
            Ok(Err(e)) => {
                warn!("ffmpeg not found: {}", e);
                false
            }
            Err(_) => {
                warn!("ffmpeg probe timed out");
                false
            }
        }
    }

    /// Encode `images` (in order) into `output_path`. Returns `false` on
    /// any failure, including termination via the subprocess slot.
    pub async fn create_video(
        &self,
        images: &[PathBuf],
        output_path: &Path,
        config: &VideoConfig,
    ) -> bool {
        if images.is_empty() {
            warn!("no images to assemble; skipping video");
            return false;
        }
        match self.run_ffmpeg(images, output_path, config).await {
            Ok(true) => {
                info!("wrote video {:?} from {} frame(s)", output_path, images.len());
                true
            }
            Ok(false) => {
                error!("ffmpeg exited unsuccessfully for {:?}", output_path);
                false
            }
            Err(e) => {
                error!("video assembly failed: {:#}", e);
                false
            }
        }
    }

    async fn run_ffmpeg(
        &self,
        images: &[PathBuf],
        output_path: &Path,
        config: &VideoConfig,
    ) -> anyhow::Result<bool> {
        let list_path = output_path.with_extension("frames.txt");
        tokio::fs::write(&list_path, build_concat_list(images, config.fps))
            .await
            .context("writing concat list")?;

        let mut command = Command::new("ffmpeg");
        command
            .arg("-y")
            .args(["-f", "concat", "-safe", "0"])
            .arg("-i")
            .arg(&list_path)
            .args(["-vsync", "vfr"])
            .args(["-c:v", config.codec.as_str()])
            .args(["-preset", config.quality.as_str()])
            .args(["-pix_fmt", "yuv420p"])
            .arg(output_path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        let child = command.spawn().context("spawning ffmpeg")?;

        *self.subprocess.lock().await = Some(child);

        // Poll rather than hold the lock across the wait, so a stop request
        // can take the child out from under us.
        let success = loop {
            let mut slot = self.subprocess.lock().await;
            let Some(child) = slot.as_mut() else {
                warn!("ffmpeg child was terminated externally");
                break false;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    *slot = None;
                    break status.success();
                }
                Ok(None) => {}
                Err(e) => {
                    *slot = None;
                    return Err(e).context("waiting for ffmpeg");
                }
            }
            drop(slot);
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        };

        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            warn!("could not remove concat list {:?}: {}", list_path, e);
        }
        Ok(success)
    }
}

/// FFmpeg concat demuxer input: one `file`/`duration` pair per frame, with
/// the final frame repeated so it is not swallowed by the demuxer.
fn build_concat_list(images: &[PathBuf], fps: u32) -> String {
    let frame_duration = 1.0 / fps.max(1) as f64;
    let mut out = String::new();
    for image in images {
        out.push_str(&format!(
            "file '{}'\nduration {:.6}\n",
            escape_concat_path(image),
            frame_duration
        ));
    }
    if let Some(last) = images.last() {
        out.push_str(&format!("file '{}'\n", escape_concat_path(last)));
    }
    out
}

fn escape_concat_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "'\\''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_list_repeats_last_frame() {
        let images = vec![PathBuf::from("/run/a.png"), PathBuf::from("/run/b.png")];
        let list = build_concat_list(&images, 24);
        let lines: Vec<&str> = list.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "file '/run/a.png'");
        assert!(lines[1].starts_with("duration 0.041"));
        assert_eq!(lines[4], "file '/run/b.png'");
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let images = vec![PathBuf::from("/run/it's.png")];
        let list = build_concat_list(&images, 24);
        assert!(list.contains("file '/run/it'\\''s.png'"));
    }

    #[tokio::test]
    async fn test_empty_image_list_is_rejected() {
        let assembler = VideoAssembler::new(Arc::new(tokio::sync::Mutex::new(None)));
        let ok = assembler
            .create_video(&[], Path::new("/tmp/out.mp4"), &VideoConfig::default())
            .await;
        assert!(!ok);
    }
}
