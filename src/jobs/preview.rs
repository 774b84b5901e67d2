//!
//! # 预览生成模块
//! Derives a preview image (and a poster for video) for an assembled media file
//!

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io;
use tokio::process::Command;
use uuid::Uuid;

use crate::media::{FileRepository, MediaFile, MediaKind};

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("Media file not found: {0}")]
    FileNotFound(Uuid),

    #[error("External tool missing: {tool}")]
    ToolMissing { tool: String },

    #[error("{tool} failed with exit code {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("IOError: {:?}", .0)]
    IOError(#[from] io::Error),
}

/// One still image to extract from `input`
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub seek_seconds: f64,
    /// Downscale to this width, keeping the aspect ratio
    pub max_width: Option<u32>,
}

pub trait PreviewRenderer: Send + Sync + 'static {
    fn render<'a>(&'a self, request: &'a RenderRequest) -> BoxFuture<'a, Result<(), PreviewError>>;
}

pub struct FfmpegRenderer {
    ffmpeg_bin: PathBuf,
}

impl FfmpegRenderer {
    pub fn new(ffmpeg_bin: PathBuf) -> Self {
        Self { ffmpeg_bin }
    }

    async fn run(&self, request: &RenderRequest) -> Result<(), PreviewError> {
        let seek = if request.seek_seconds.is_finite() && request.seek_seconds >= 0.0 {
            request.seek_seconds
        } else {
            0.0
        };

        let mut command = Command::new(&self.ffmpeg_bin);
        command
            .args(["-nostdin", "-y", "-loglevel", "error"])
            .args(["-ss", &format!("{seek:.3}")])
            .arg("-i")
            .arg(&request.input)
            // audio files yield their embedded cover art as the video stream
            .args(["-an", "-frames:v", "1"]);
        if let Some(width) = request.max_width {
            command.args(["-vf", &format!("scale='min({width},iw)':-2")]);
        }
        let output = command
            .args(["-q:v", "3"])
            .arg(&request.output)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => PreviewError::ToolMissing {
                    tool: self.ffmpeg_bin.display().to_string(),
                },
                _ => PreviewError::IOError(err),
            })?;

        if !output.status.success() || !request.output.exists() {
            return Err(PreviewError::ToolFailed {
                tool: "ffmpeg".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

impl PreviewRenderer for FfmpegRenderer {
    fn render<'a>(&'a self, request: &'a RenderRequest) -> BoxFuture<'a, Result<(), PreviewError>> {
        self.run(request).boxed()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreviewOutcome {
    Generated {
        preview_path: String,
        poster_path: Option<String>,
    },
    /// The file already had every asset for its kind
    AlreadyPresent,
    /// Nothing to render for this kind of media
    NotApplicable,
}

pub struct PreviewAssetJob {
    files: Arc<dyn FileRepository>,
    renderer: Arc<dyn PreviewRenderer>,
    library_dir: PathBuf,
    work_dir: PathBuf,
    max_width: u32,
}

impl PreviewAssetJob {
    pub fn new(
        files: Arc<dyn FileRepository>,
        renderer: Arc<dyn PreviewRenderer>,
        library_dir: PathBuf,
        work_dir: PathBuf,
        max_width: u32,
    ) -> Self {
        Self {
            files,
            renderer,
            library_dir,
            work_dir,
            max_width,
        }
    }

    /// Work-dir relative asset names of one file
    pub fn asset_paths(id: Uuid) -> (String, String) {
        (format!("previews/{id}.jpg"), format!("previews/{id}.poster.jpg"))
    }

    pub async fn run(&self, file_id: Uuid) -> Result<PreviewOutcome, PreviewError> {
        let file = self.files.get(file_id).ok_or(PreviewError::FileNotFound(file_id))?;

        if file.kind == MediaKind::Other {
            debug!("No preview for {} ({})", file.id, file.path);
            return Ok(PreviewOutcome::NotApplicable);
        }
        if file.has_preview_assets() {
            debug!("Preview assets already present for {}", file.id);
            return Ok(PreviewOutcome::AlreadyPresent);
        }

        let input = self.library_dir.join(&file.path);
        let (preview_name, poster_name) = Self::asset_paths(file.id);

        let mut rendered = Vec::new();
        let preview_path = match &file.preview_path {
            Some(existing) => existing.clone(),
            None => {
                let seek = if file.kind == MediaKind::Video { 1.0 } else { 0.0 };
                self.render(&input, &preview_name, seek, Some(self.max_width)).await?;
                rendered.push(preview_name.clone());
                preview_name
            }
        };

        let poster_path = match (&file.poster_path, file.kind) {
            (Some(existing), _) => Some(existing.clone()),
            (None, MediaKind::Video) => {
                if let Err(err) = self.render(&input, &poster_name, 0.0, None).await {
                    self.discard(&rendered).await;
                    return Err(err);
                }
                rendered.push(poster_name.clone());
                Some(poster_name)
            }
            (None, _) => None,
        };

        let written = self
            .files
            .set_preview_assets(file.id, Some(preview_path.clone()), poster_path.clone());
        if !written {
            // the record was removed while rendering
            warn!("Media file {} vanished before its preview was saved", file.id);
            self.discard(&rendered).await;
            return Err(PreviewError::FileNotFound(file.id));
        }
        info!("Generated preview assets for {} ({})", file.id, file.path);

        Ok(PreviewOutcome::Generated { preview_path, poster_path })
    }

    async fn render(
        &self,
        input: &Path,
        name: &str,
        seek_seconds: f64,
        max_width: Option<u32>,
    ) -> Result<(), PreviewError> {
        let output = self.work_dir.join(name);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }

        let request = RenderRequest {
            input: input.to_path_buf(),
            output,
            seek_seconds,
            max_width,
        };
        self.renderer.render(&request).await
    }

    async fn discard(&self, names: &[String]) {
        for name in names {
            match fs::remove_file(self.work_dir.join(name)).await {
                Ok(()) => debug!("Removed orphaned asset {name}"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove orphaned asset {name}: {err}"),
            }
        }
    }

    /// Materialize the library record of an assembled transfer
    pub fn register(&self, path: String, content_type: Option<&str>, size: u64) -> MediaFile {
        let kind = MediaKind::detect(content_type, Path::new(&path));
        let file = MediaFile::new(path, kind, size);
        self.files.insert(file.clone());

        file
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Writes a placeholder image, or fails every call
    #[derive(Default)]
    pub struct FakeRenderer {
        pub calls: AtomicUsize,
        pub failing: bool,
        pub delay: Option<Duration>,
    }

    impl FakeRenderer {
        pub fn failing() -> Self {
            Self { failing: true, ..Self::default() }
        }

        /// Takes `delay` before writing each image
        pub fn slow(delay: Duration) -> Self {
            Self { delay: Some(delay), ..Self::default() }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PreviewRenderer for FakeRenderer {
        fn render<'a>(&'a self, request: &'a RenderRequest) -> BoxFuture<'a, Result<(), PreviewError>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.failing {
                    return Err(PreviewError::ToolFailed {
                        tool: "ffmpeg".into(),
                        code: Some(1),
                        stderr: "Invalid data found when processing input".into(),
                    });
                }
                fs::write(&request.output, b"jpeg").await?;
                Ok(())
            }
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::fake::FakeRenderer;
    use super::*;
    use crate::media::MemoryFileRepository;

    /// Counts preview writes on top of the in-memory repository
    #[derive(Default)]
    struct CountingRepository {
        inner: MemoryFileRepository,
        writes: AtomicUsize,
    }

    impl FileRepository for CountingRepository {
        fn insert(&self, file: MediaFile) {
            self.inner.insert(file)
        }

        fn get(&self, id: Uuid) -> Option<MediaFile> {
            self.inner.get(id)
        }

        fn set_preview_assets(
            &self,
            id: Uuid,
            preview_path: Option<String>,
            poster_path: Option<String>,
        ) -> bool {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_preview_assets(id, preview_path, poster_path)
        }

        fn remove(&self, id: Uuid) -> Option<MediaFile> {
            self.inner.remove(id)
        }

        fn all(&self) -> Vec<MediaFile> {
            self.inner.all()
        }
    }

    /// Deletes every file record before rendering, like a concurrent library removal
    struct RemovingRenderer {
        files: Arc<MemoryFileRepository>,
        inner: FakeRenderer,
    }

    impl PreviewRenderer for RemovingRenderer {
        fn render<'a>(&'a self, request: &'a RenderRequest) -> BoxFuture<'a, Result<(), PreviewError>> {
            for file in self.files.all() {
                self.files.remove(file.id);
            }
            self.inner.render(request)
        }
    }

    struct Fixture {
        _dirs: (tempfile::TempDir, tempfile::TempDir),
        files: Arc<CountingRepository>,
        renderer: Arc<FakeRenderer>,
        job: PreviewAssetJob,
    }

    fn fixture(renderer: FakeRenderer) -> Fixture {
        let library = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let files = Arc::new(CountingRepository::default());
        let renderer = Arc::new(renderer);
        let job = PreviewAssetJob::new(
            files.clone(),
            renderer.clone(),
            library.path().to_path_buf(),
            work.path().to_path_buf(),
            480,
        );

        Fixture { _dirs: (library, work), files, renderer, job }
    }

    #[tokio::test]
    async fn should_generate_preview_and_poster_for_video() {
        let fx = fixture(FakeRenderer::default());
        let file = fx.job.register("clips/a.mp4".into(), None, 10);

        let outcome = fx.job.run(file.id).await.unwrap();
        let (preview, poster) = PreviewAssetJob::asset_paths(file.id);

        assert_eq!(
            outcome,
            PreviewOutcome::Generated { preview_path: preview.clone(), poster_path: Some(poster) }
        );
        assert_eq!(fx.renderer.call_count(), 2);
        assert_eq!(fx.files.get(file.id).unwrap().preview_path, Some(preview));
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let fx = fixture(FakeRenderer::default());
        let file = fx.job.register("a.jpg".into(), Some("image/jpeg"), 10);

        fx.job.run(file.id).await.unwrap();
        let outcome = fx.job.run(file.id).await.unwrap();

        assert_eq!(outcome, PreviewOutcome::AlreadyPresent);
        assert_eq!(fx.renderer.call_count(), 1);
        assert_eq!(fx.files.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_media_is_not_applicable() {
        let fx = fixture(FakeRenderer::default());
        let file = fx.job.register("a.zip".into(), Some("application/zip"), 10);

        assert_eq!(fx.job.run(file.id).await.unwrap(), PreviewOutcome::NotApplicable);
        assert_eq!(fx.renderer.call_count(), 0);
    }

    #[tokio::test]
    async fn render_failure_is_reported_without_write() {
        let fx = fixture(FakeRenderer::failing());
        let file = fx.job.register("a.mp3".into(), None, 10);

        let err = fx.job.run(file.id).await.unwrap_err();

        assert!(matches!(err, PreviewError::ToolFailed { code: Some(1), .. }));
        assert_eq!(fx.files.writes.load(Ordering::SeqCst), 0);
        assert!(fx.files.get(file.id).unwrap().preview_path.is_none());
    }

    #[tokio::test]
    async fn unknown_file_is_an_error() {
        let fx = fixture(FakeRenderer::default());

        assert!(matches!(fx.job.run(Uuid::new_v4()).await, Err(PreviewError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn removed_record_discards_rendered_assets() {
        let library = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let files = Arc::new(MemoryFileRepository::new());
        let renderer = Arc::new(RemovingRenderer { files: files.clone(), inner: FakeRenderer::default() });
        let job = PreviewAssetJob::new(
            files.clone(),
            renderer.clone(),
            library.path().to_path_buf(),
            work.path().to_path_buf(),
            480,
        );
        let file = job.register("a.png".into(), Some("image/png"), 10);

        let err = job.run(file.id).await.unwrap_err();
        let (preview, _) = PreviewAssetJob::asset_paths(file.id);

        assert!(matches!(err, PreviewError::FileNotFound(id) if id == file.id));
        assert_eq!(renderer.inner.call_count(), 1);
        assert!(!work.path().join(preview).exists());
        assert!(files.get(file.id).is_none());
    }
}
