//! Chrome-backed rendering contexts, driven over CDP by chromiumoxide

use crate::browser_pool::{BrowserFactory, RenderContext};
use crate::config::create_browser_config_with_instance_id;
use crate::{CaptureError, Config, OutputFormat, RenderOptions, Viewport};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Network errors Chrome reports for targets that will never load.
const PERMANENT_NET_ERRORS: &[&str] = &[
    "net::ERR_INVALID_URL",
    "net::ERR_UNSAFE_PORT",
    "net::ERR_DISALLOWED_URL_SCHEME",
    "net::ERR_UNKNOWN_URL_SCHEME",
    "net::ERR_BLOCKED_BY_CLIENT",
    "net::ERR_BLOCKED_BY_RESPONSE",
    "net::ERR_BLOCKED_BY_ADMINISTRATOR",
];

/// Sorts a CDP failure into retryable navigation trouble or a permanent one.
pub fn classify_cdp_error(message: &str) -> CaptureError {
    if PERMANENT_NET_ERRORS
        .iter()
        .any(|code| message.contains(code))
    {
        return CaptureError::PermanentRenderFailure(message.to_string());
    }
    CaptureError::NavigationFailure(message.to_string())
}

fn page_error(err: CdpError) -> CaptureError {
    classify_cdp_error(&err.to_string())
}

/// Launches one headless Chrome per pool slot.
pub struct ChromeFactory {
    config: Config,
}

impl ChromeFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserFactory for ChromeFactory {
    async fn launch(&self, slot_id: usize) -> Result<Box<dyn RenderContext>, CaptureError> {
        let browser_config = create_browser_config_with_instance_id(&self.config, slot_id)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser {} handler error: {}", slot_id, e);
                }
            }
            debug!("Browser {} handler finished", slot_id);
        });

        Ok(Box::new(ChromeContext {
            slot_id,
            browser: Mutex::new(browser),
            handler,
        }))
    }
}

pub struct ChromeContext {
    slot_id: usize,
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
}

impl ChromeContext {
    async fn render(
        &self,
        page: &Page,
        target: &Url,
        options: &RenderOptions,
        viewport: &Viewport,
    ) -> Result<Vec<u8>, CaptureError> {
        let emulation_params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(CaptureError::PermanentRenderFailure)?;
        page.execute(emulation_params).await.map_err(page_error)?;

        page.goto(target.as_str()).await.map_err(page_error)?;

        if let Some(wait) = options.wait() {
            tokio::time::sleep(wait).await;
        }

        if options.format == OutputFormat::Pdf {
            return page
                .pdf(PrintToPdfParams::default())
                .await
                .map_err(page_error);
        }

        if let Some(selector) = &options.selector {
            let element = page.find_element(selector.as_str()).await.map_err(|e| {
                CaptureError::PermanentRenderFailure(format!(
                    "element {selector} not found: {e}"
                ))
            })?;
            return element
                .screenshot(CaptureScreenshotFormat::Png)
                .await
                .map_err(page_error);
        }

        let screenshot_params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(options.full_page)
            .build();

        page.screenshot(screenshot_params).await.map_err(page_error)
    }
}

#[async_trait]
impl RenderContext for ChromeContext {
    async fn capture(
        &self,
        target: &Url,
        options: &RenderOptions,
        viewport: &Viewport,
    ) -> Result<Vec<u8>, CaptureError> {
        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| CaptureError::BrowserUnavailable(e.to_string()))?
        };

        let result = self.render(&page, target, options, viewport).await;

        if let Err(e) = page.close().await {
            debug!("Failed to close page on browser {}: {}", self.slot_id, e);
        }

        result
    }

    fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn close(&self) {
        if let Err(e) = self.browser.lock().await.close().await {
            debug!("Browser {} close failed: {}", self.slot_id, e);
        }
        self.handler.abort();
    }
}
