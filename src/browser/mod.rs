//! Chrome バックエンド (chromiumoxide)

mod page;

use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RunOptions;
use crate::error::ScraperError;

pub use page::ChromePage;

/// 1回の実行で使うブラウザセッション
///
/// `close()` は必ず呼ぶこと。呼ばれずに破棄された場合も
/// chromiumoxide の `Browser` の Drop が子プロセスを終了させる。
pub struct ChromeSession {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
    debug: bool,
}

impl ChromeSession {
    /// ブラウザを起動
    pub async fn launch(options: &RunOptions) -> Result<Self, ScraperError> {
        info!("Launching browser (headless={})...", options.headless);

        // ユニークなユーザーデータディレクトリを生成
        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("school-scraper-{}", unique_id));

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&user_data_dir)
            .window_size(1920, 1080);

        // 未指定なら chromiumoxide の自動検出に任せる
        if let Some(chrome_path) = options.resolve_chrome_path() {
            debug!("Using browser executable {}", chrome_path.display());
            builder = builder.chrome_executable(chrome_path);
        }

        if !options.headless {
            builder = builder.with_head();
        }

        builder = builder
            .no_sandbox()
            .request_timeout(Duration::from_secs(60))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if options.debug {
            builder = builder.arg("--enable-logging=stderr").arg("--v=1");
        }

        let browser_config = builder.build().map_err(ScraperError::BrowserInit)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScraperError::BrowserInit(e.to_string()))?;

        // ハンドラータスクを起動
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {:?}", e);
                }
            }
        });

        info!("Browser launched");
        Ok(Self {
            browser,
            handler,
            user_data_dir,
            debug: options.debug,
        })
    }

    /// 新しいタブを開く
    pub async fn new_page(&self) -> Result<ChromePage, ScraperError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScraperError::BrowserInit(format!("ページ作成失敗: {}", e)))?;
        Ok(ChromePage::new(page, self.debug))
    }

    /// ブラウザを終了し、一時ディレクトリを削除する
    pub async fn close(mut self) -> Result<(), ScraperError> {
        info!("Closing browser...");
        let closed = self.browser.close().await;
        if let Err(e) = self.browser.wait().await {
            debug!("Browser process wait failed: {}", e);
        }
        self.handler.abort();

        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!(
                "Could not remove {}: {}",
                self.user_data_dir.display(),
                e
            );
        }

        match closed {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Browser close failed: {}", e);
                Err(ScraperError::BrowserInit(format!("ブラウザ終了失敗: {}", e)))
            }
        }
    }
}
