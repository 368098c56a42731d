//! 詳細ページの取得
//!
//! 1件の失敗で実行全体を止めないよう、結果は常に `Outcome` で返す。

use tracing::{debug, warn};

use crate::error::{Outcome, ScraperError, Skip, SkipKind};
use crate::extract::{extract, Extraction};
use crate::profile::SiteProfile;
use crate::record::{assemble, SchoolRecord};
use crate::traits::BrowserPage;

pub struct DetailFetcher<'a, P: BrowserPage + ?Sized> {
    page: &'a P,
    profile: &'a SiteProfile,
    debug: bool,
}

impl<'a, P: BrowserPage + ?Sized> DetailFetcher<'a, P> {
    pub fn new(page: &'a P, profile: &'a SiteProfile) -> Self {
        Self {
            page,
            profile,
            debug: false,
        }
    }

    /// 失敗時にスクリーンショットをログへ出す
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// 詳細ページを開いてレコードを作る
    ///
    /// 読み込み・待機・スナップショットはリトライ対象。
    /// 必須フィールド欠落と不正なレコードはスキップ、ブラウザ喪失は Fatal。
    pub async fn fetch(&self, url: &str) -> Outcome<SchoolRecord> {
        let page = self.page;
        let profile = self.profile;

        let loaded = profile
            .retry_policy()
            .run("load detail page", move || async move {
                page.goto(url, profile.page_load_timeout()).await?;
                if !profile.detail_ready().is_empty() {
                    page.wait_for(profile.detail_ready(), profile.element_wait_timeout())
                        .await?;
                }
                page.wait_stable(profile.stable_timeout()).await?;
                page.snapshot().await
            })
            .await;

        let snapshot = match loaded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.log_screenshot(url).await;
                return match e {
                    ScraperError::BrowserInit(_)
                    | ScraperError::Cancelled
                    | ScraperError::Config(_) => Outcome::Fatal(e),
                    other => {
                        let failure = ScraperError::FetchFailure {
                            url: url.to_string(),
                            source: Box::new(other),
                        };
                        Outcome::Skipped(Skip::new(
                            url,
                            SkipKind::FetchFailure,
                            failure.to_string(),
                        ))
                    }
                };
            }
        };

        build_record(&extract(&snapshot, profile), profile, url)
    }

    async fn log_screenshot(&self, url: &str) {
        if !self.debug {
            return;
        }
        match self.page.screenshot().await {
            Ok(png) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
                debug!("Failed page {}: data:image/png;base64,{}", url, encoded);
            }
            Err(e) => warn!("Screenshot of {} failed: {}", url, e),
        }
    }
}

/// 抽出結果からレコードを作る。必須フィールド欠落と不正なレコードはスキップ
pub fn build_record(
    extraction: &Extraction,
    profile: &SiteProfile,
    source_url: &str,
) -> Outcome<SchoolRecord> {
    if let Some(missing) = extraction.missing.first() {
        let e = ScraperError::FieldMissing {
            field: missing.field.clone(),
            url: source_url.to_string(),
        };
        return Outcome::Skipped(Skip::new(
            source_url,
            SkipKind::FieldMissing,
            e.to_string(),
        ));
    }

    match assemble(&extraction.record, profile, source_url) {
        Ok(record) => {
            debug!("Extracted '{}' from {}", record.name, source_url);
            Outcome::Ok(record)
        }
        Err(rejection) => Outcome::Skipped(Skip::new(
            source_url,
            SkipKind::InvalidRecord,
            rejection.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{detail, profile, url, Failure, FakeSite, DETAIL_RULES};

    #[tokio::test]
    async fn test_fetch_builds_normalized_record() {
        let site = FakeSite::new().page("/schools/3", &detail(3));
        let profile = profile(DETAIL_RULES);

        let record = DetailFetcher::new(&site, &profile)
            .fetch(&url("/schools/3"))
            .await
            .ok()
            .unwrap();
        assert_eq!(record.name, "School 3");
        assert_eq!(record.address1, "300 Main St");
        assert_eq!(record.city, "Austin");
        assert_eq!(record.state, "TX");
        assert_eq!(record.zip, "78701");
        assert_eq!(record.phone, "(512) 555-0103");
        assert_eq!(record.source_url, url("/schools/3"));
    }

    #[tokio::test]
    async fn test_missing_required_field_is_skipped() {
        let site = FakeSite::new().page(
            "/schools/8",
            r#"<div class="addr">1 Elm St, Waco, TX 76701</div>"#,
        );
        let profile = profile(DETAIL_RULES);

        match DetailFetcher::new(&site, &profile).fetch(&url("/schools/8")).await {
            Outcome::Skipped(skip) => {
                assert_eq!(skip.kind, SkipKind::FieldMissing);
                assert!(skip.reason.contains("name"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_name_is_invalid_record() {
        let site = FakeSite::new().page("/schools/9", "<h1>2023 Report Card</h1>");
        let profile = profile(&format!("{}reject_names: [report card]\n", DETAIL_RULES));

        match DetailFetcher::new(&site, &profile).fetch(&url("/schools/9")).await {
            Outcome::Skipped(skip) => assert_eq!(skip.kind, SkipKind::InvalidRecord),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeouts_are_retried_then_skipped() {
        let site = FakeSite::new().failing("/schools/4", Failure::Timeout);
        let profile = profile(DETAIL_RULES);

        match DetailFetcher::new(&site, &profile).fetch(&url("/schools/4")).await {
            Outcome::Skipped(skip) => {
                assert_eq!(skip.kind, SkipKind::FetchFailure);
                assert_eq!(skip.url, url("/schools/4"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(site.gotos().len(), 3);
    }

    #[tokio::test]
    async fn test_lost_browser_is_fatal() {
        let site = FakeSite::new().failing("/schools/4", Failure::Crash);
        let profile = profile(DETAIL_RULES);

        let outcome = DetailFetcher::new(&site, &profile)
            .fetch(&url("/schools/4"))
            .await;
        assert!(matches!(outcome, Outcome::Fatal(ScraperError::BrowserInit(_))));
        assert_eq!(site.gotos().len(), 1);
    }
}
