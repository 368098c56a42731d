use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::Local;
use tower::Service;
use tracing::info;

use crate::config::RunOptions;
use crate::error::ScraperError;
use crate::export::{default_output_path, CsvExporter};
use crate::profile::SiteProfile;
use crate::runner::{CancelFlag, RunReport, RunStatus, SchoolScraper};

/// スクレイピングリクエスト
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub profile_path: PathBuf,
    pub options: RunOptions,
}

impl ScrapeRequest {
    pub fn new(profile_path: impl Into<PathBuf>) -> Self {
        Self {
            profile_path: profile_path.into(),
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options = self.options.with_output_path(path);
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.options = self.options.with_headless(headless);
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.options = self.options.with_max_items(max_items);
        self
    }
}

/// スクレイピング結果
#[derive(Debug)]
pub struct ScrapeResult {
    pub report: RunReport,
    pub output_path: PathBuf,
}

impl ScrapeResult {
    pub fn status(&self) -> RunStatus {
        self.report.status()
    }
}

/// tower::Serviceを実装したスクレイパーサービス
#[derive(Debug, Clone, Default)]
pub struct ScraperService {
    cancel: CancelFlag,
}

impl ScraperService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 実行中のリクエストを中断するためのフラグ
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Service<ScrapeRequest> for ScraperService {
    type Response = ScrapeResult;
    type Error = ScraperError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ScrapeRequest) -> Self::Future {
        info!("スクレイピングリクエスト受信: profile={}", req.profile_path.display());
        let cancel = self.cancel.clone();

        Box::pin(async move {
            // 設定エラーはブラウザ起動前に返す
            let profile = SiteProfile::load(&req.profile_path)?;
            let output_path = req
                .options
                .output_path
                .clone()
                .unwrap_or_else(|| default_output_path(profile.site(), Local::now()));

            let scraper = SchoolScraper::new(profile, req.options).with_cancel_flag(cancel);
            let report = scraper.run().await?;

            // 中断・打ち切りでも取得済みのレコードは書き出す
            CsvExporter::new(scraper.profile().columns())
                .write_path(&output_path, &report.records)?;

            info!(
                "スクレイピング完了: path={:?}, {}",
                output_path,
                report.summary()
            );

            Ok(ScrapeResult {
                report,
                output_path,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_request_builder() {
        let req = ScrapeRequest::new("profiles/tx_schools.yaml")
            .with_output_path("/tmp/tx.csv")
            .with_headless(false)
            .with_max_items(5);

        assert_eq!(req.profile_path, PathBuf::from("profiles/tx_schools.yaml"));
        assert_eq!(req.options.output_path, Some(PathBuf::from("/tmp/tx.csv")));
        assert!(!req.options.headless);
        assert_eq!(req.options.max_items, Some(5));
    }

    #[tokio::test]
    async fn test_invalid_profile_fails_before_browser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "site: broken\nlinks: {selectors: [a]}\n").unwrap();

        let mut service = ScraperService::new();
        let err = service.call(ScrapeRequest::new(path.clone())).await.unwrap_err();
        assert!(matches!(err, ScraperError::Config(_)));
    }
}
