//! Runs one render attempt: capture on a borrowed context, convert, upload.

use crate::browser_pool::BrowserHandle;
use crate::storage::Storage;
use crate::utils::validate_url;
use crate::{CaptureError, Job, OutputFormat, Viewport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderResult {
    pub url: String,
    pub processing_time: Duration,
    pub size: usize,
    pub content_type: &'static str,
}

pub struct JobExecutor {
    storage: Arc<dyn Storage>,
    render_timeout: Duration,
    default_viewport: Viewport,
}

impl JobExecutor {
    pub fn new(
        storage: Arc<dyn Storage>,
        render_timeout: Duration,
        default_viewport: Viewport,
    ) -> Self {
        Self {
            storage,
            render_timeout,
            default_viewport,
        }
    }

    /// Renders `job` on the lent context.
    ///
    /// Failures come back classified: `Timeout` when the capture overruns the
    /// render timeout, `NavigationFailure` for transient load trouble and
    /// `PermanentRenderFailure` for targets or formats that will never work.
    /// Upload trouble surfaces as a retryable `Storage` error. The upload gets
    /// its own render timeout.
    pub async fn execute(
        &self,
        job: &Job,
        handle: &BrowserHandle,
    ) -> Result<RenderResult, CaptureError> {
        let started = Instant::now();

        let target = validate_url(&job.url)
            .map_err(|e| CaptureError::PermanentRenderFailure(e.to_string()))?;
        let context = handle.context().ok_or_else(|| {
            CaptureError::BrowserUnavailable("browser handle already returned".to_string())
        })?;
        let viewport = job.options.viewport.as_ref().unwrap_or(&self.default_viewport);

        let capture = context.capture(&target, &job.options, viewport);
        let raw = match timeout(self.render_timeout, capture).await {
            Ok(result) => result?,
            Err(_) => return Err(CaptureError::Timeout(self.render_timeout)),
        };

        let format = job.options.format;
        let bytes = convert_image_format(raw, format)?;
        let size = bytes.len();

        let filename = format!("{}.{}", job.id, format.extension());
        let upload = self.storage.upload(bytes, &filename, format.content_type());
        let url = match timeout(self.render_timeout, upload).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CaptureError::Storage(format!(
                    "upload of {filename} timed out after {:?}",
                    self.render_timeout
                )))
            }
        };

        let processing_time = started.elapsed();
        debug!(
            "Rendered job {} into {} bytes of {} in {:?}",
            job.id,
            size,
            format.content_type(),
            processing_time
        );

        Ok(RenderResult {
            url,
            processing_time,
            size,
            content_type: format.content_type(),
        })
    }
}

/// Re-encodes a PNG capture into the requested image format. PDF and PNG
/// pass through untouched.
pub fn convert_image_format(
    png_data: Vec<u8>,
    format: OutputFormat,
) -> Result<Vec<u8>, CaptureError> {
    let target = match format {
        OutputFormat::Png | OutputFormat::Pdf => return Ok(png_data),
        OutputFormat::Jpeg => image::ImageFormat::Jpeg,
        OutputFormat::Webp => image::ImageFormat::WebP,
    };

    let img = image::load_from_memory(&png_data)
        .map_err(|e| CaptureError::PermanentRenderFailure(format!("unreadable capture: {e}")))?;

    // JPEG has no alpha channel
    let img = match format {
        OutputFormat::Jpeg => image::DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img,
    };

    let mut converted = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut converted), target)
        .map_err(|e| {
            CaptureError::PermanentRenderFailure(format!("cannot encode {format:?}: {e}"))
        })?;

    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser_pool::{BrowserFactory, BrowserPool, RenderContext};
    use crate::storage::MockStorage;
    use crate::{CaptureRequest, RenderOptions};
    use async_trait::async_trait;
    use url::Url;

    enum Behaviour {
        Succeed,
        Hang,
        Fail(CaptureError),
    }

    struct ScriptedContext(Arc<Behaviour>);

    #[async_trait]
    impl RenderContext for ScriptedContext {
        async fn capture(
            &self,
            _target: &Url,
            _options: &RenderOptions,
            _viewport: &Viewport,
        ) -> Result<Vec<u8>, CaptureError> {
            match self.0.as_ref() {
                Behaviour::Succeed => Ok(tiny_png()),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
                Behaviour::Fail(e) => Err(e.clone()),
            }
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    struct ScriptedFactory(Arc<Behaviour>);

    #[async_trait]
    impl BrowserFactory for ScriptedFactory {
        async fn launch(&self, _slot_id: usize) -> Result<Box<dyn RenderContext>, CaptureError> {
            Ok(Box::new(ScriptedContext(self.0.clone())))
        }
    }

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([255, 0, 0, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn job_for(url: &str, format: OutputFormat) -> Job {
        Job::new(
            CaptureRequest {
                user_id: "alice".to_string(),
                url: url.to_string(),
                options: RenderOptions {
                    format,
                    ..Default::default()
                },
                webhook_url: None,
            },
            1,
        )
    }

    async fn run(
        behaviour: Behaviour,
        storage: impl Storage + 'static,
        job: &Job,
    ) -> Result<RenderResult, CaptureError> {
        let pool = BrowserPool::new(
            Arc::new(ScriptedFactory(Arc::new(behaviour))),
            1,
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        let executor =
            JobExecutor::new(Arc::new(storage), Duration::from_secs(5), Viewport::default());

        let handle = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let result = executor.execute(job, &handle).await;
        pool.release(handle, true).await;
        result
    }

    #[tokio::test]
    async fn test_successful_render_uploads_artifact() {
        let job = job_for("https://example.com", OutputFormat::Jpeg);
        let expected_name = format!("{}.jpg", job.id);

        let mut storage = MockStorage::new();
        storage
            .expect_upload()
            .withf(move |bytes, filename, content_type| {
                !bytes.is_empty()
                    && filename.to_string() == expected_name
                    && content_type.to_string() == "image/jpeg"
            })
            .times(1)
            .returning(|_, _, _| Ok("https://cdn.example.com/shot.jpg".to_string()));

        let result = run(Behaviour::Succeed, storage, &job).await.unwrap();
        assert_eq!(result.url, "https://cdn.example.com/shot.jpg");
        assert_eq!(result.content_type, "image/jpeg");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_render_times_out() {
        let mut storage = MockStorage::new();
        storage.expect_upload().never();

        let job = job_for("https://example.com", OutputFormat::Png);
        let err = run(Behaviour::Hang, storage, &job).await.unwrap_err();
        assert_eq!(err, CaptureError::Timeout(Duration::from_secs(5)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_target_is_permanent() {
        let mut storage = MockStorage::new();
        storage.expect_upload().never();

        let job = job_for("ftp://example.com/file", OutputFormat::Png);
        let err = run(Behaviour::Succeed, storage, &job).await.unwrap_err();
        assert!(matches!(err, CaptureError::PermanentRenderFailure(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_navigation_failure_passes_through() {
        let mut storage = MockStorage::new();
        storage.expect_upload().never();

        let job = job_for("https://example.com", OutputFormat::Png);
        let failure = CaptureError::NavigationFailure("net::ERR_NAME_NOT_RESOLVED".to_string());
        let err = run(Behaviour::Fail(failure.clone()), storage, &job).await.unwrap_err();
        assert_eq!(err, failure);
    }

    #[tokio::test]
    async fn test_upload_failure_is_retryable() {
        let mut storage = MockStorage::new();
        storage
            .expect_upload()
            .returning(|_, _, _| Err(CaptureError::Storage("disk full".to_string())));

        let job = job_for("https://example.com", OutputFormat::Png);
        let err = run(Behaviour::Succeed, storage, &job).await.unwrap_err();
        assert!(err.is_retryable());
    }

    struct StalledStorage;

    #[async_trait]
    impl Storage for StalledStorage {
        async fn upload(
            &self,
            _bytes: Vec<u8>,
            _filename: &str,
            _content_type: &str,
        ) -> Result<String, CaptureError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("https://cdn.example.com/late.png".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_upload_times_out_as_storage_error() {
        let job = job_for("https://example.com", OutputFormat::Png);
        let started = tokio::time::Instant::now();

        let err = run(Behaviour::Succeed, StalledStorage, &job).await.unwrap_err();
        assert!(matches!(&err, CaptureError::Storage(message) if message.contains("timed out")));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_convert_image_format() {
        let png = tiny_png();
        assert_eq!(convert_image_format(png.clone(), OutputFormat::Png).unwrap(), png);

        let jpeg = convert_image_format(png.clone(), OutputFormat::Jpeg).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), image::ImageFormat::Jpeg);

        assert!(matches!(
            convert_image_format(vec![0, 1, 2], OutputFormat::Webp),
            Err(CaptureError::PermanentRenderFailure(_))
        ));
    }
}
