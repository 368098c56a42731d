//! 1回の実行 (一覧巡回 → 詳細取得 → レコード) と実行レポート

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::browser::ChromeSession;
use crate::config::RunOptions;
use crate::detail::{build_record, DetailFetcher};
use crate::error::{Outcome, ScraperError, Skip, SkipKind};
use crate::navigation::Navigator;
use crate::profile::SiteProfile;
use crate::record::SchoolRecord;
use crate::traits::BrowserPage;

/// 実行の中断要求。詳細取得の合間に確認される
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// 全件取得
    Complete,
    /// スキップ・一覧の打ち切り・中断あり
    Partial,
    /// データを1件も得る前に失敗
    Aborted,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Complete => 0,
            RunStatus::Partial => 2,
            RunStatus::Aborted => 1,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub site: String,
    pub records: Vec<SchoolRecord>,
    /// 詳細取得を試みた件数
    pub attempted: usize,
    pub skipped: Vec<Skip>,
    pub pages_visited: u32,
    pub filtered: bool,
    pub listing_error: Option<ScraperError>,
    pub cancelled: bool,
    pub aborted: Option<ScraperError>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl RunReport {
    fn new(site: &str) -> Self {
        let now = Local::now();
        Self {
            site: site.to_string(),
            records: Vec::new(),
            attempted: 0,
            skipped: Vec::new(),
            pages_visited: 0,
            filtered: false,
            listing_error: None,
            cancelled: false,
            aborted: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn written(&self) -> usize {
        self.records.len()
    }

    pub fn status(&self) -> RunStatus {
        if self.aborted.is_some() && self.records.is_empty() {
            RunStatus::Aborted
        } else if self.aborted.is_some()
            || self.cancelled
            || self.listing_error.is_some()
            || !self.skipped.is_empty()
        {
            RunStatus::Partial
        } else {
            RunStatus::Complete
        }
    }

    pub fn skips_by_kind(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for skip in &self.skipped {
            *counts.entry(skip.kind.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn skipped_of(&self, kind: SkipKind) -> usize {
        self.skipped.iter().filter(|s| s.kind == kind).count()
    }

    /// 1行サマリ
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: {} written / {} attempted / {} skipped",
            self.site,
            self.written(),
            self.attempted,
            self.skipped.len()
        );
        let kinds = self.skips_by_kind();
        if !kinds.is_empty() {
            let parts: Vec<String> = kinds.iter().map(|(k, n)| format!("{}={}", k, n)).collect();
            line.push_str(&format!(" ({})", parts.join(", ")));
        }
        if let Some(e) = &self.listing_error {
            line.push_str(&format!("; listing stopped: {}", e));
        }
        if self.cancelled {
            line.push_str("; cancelled");
        }
        if let Some(e) = &self.aborted {
            line.push_str(&format!("; aborted: {}", e));
        }
        line.push_str(&format!(
            " in {}s",
            (self.finished_at - self.started_at).num_seconds()
        ));
        line
    }
}

/// 渡されたページで1回分の実行を行う
///
/// 失敗は全てレポートに記録され、ここからエラーは返らない。
pub async fn run_with_page<P: BrowserPage + ?Sized>(
    page: &P,
    profile: &SiteProfile,
    options: &RunOptions,
    cancel: &CancelFlag,
) -> RunReport {
    let mut report = RunReport::new(profile.site());
    info!("Starting run for '{}'", profile.site());

    let listing = match Navigator::new(page, profile).run().await {
        Ok(listing) => listing,
        Err(e) => {
            error!("Could not start listing: {}", e);
            report.aborted = Some(e);
            report.finished_at = Local::now();
            return report;
        }
    };
    report.pages_visited = listing.pages_visited;
    report.filtered = listing.filtered;
    report.listing_error = listing.error;

    if listing.links.is_empty() && !listing.rows.is_empty() {
        warn!(
            "No detail links found, building {} records from listing rows",
            listing.rows.len()
        );
        for row in &listing.rows {
            report.attempted += 1;
            match build_record(&row.extraction, profile, &row.source_url) {
                Outcome::Ok(record) => report.records.push(record),
                Outcome::Skipped(skip) => {
                    warn!("Skipped row {} ({}): {}", skip.url, skip.kind, skip.reason);
                    report.skipped.push(skip);
                }
                Outcome::Fatal(e) => {
                    report.aborted = Some(e);
                    break;
                }
            }
        }
        report.finished_at = Local::now();
        info!("{}", report.summary());
        return report;
    }

    let fetcher = DetailFetcher::new(page, profile).with_debug(options.debug);
    let total = listing.links.len();

    for (index, url) in listing.links.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!(
                "Cancelled after {} of {} detail pages",
                report.attempted, total
            );
            report.cancelled = true;
            break;
        }
        if index > 0 {
            sleep(profile.request_delay()).await;
        }

        report.attempted += 1;
        info!("[{}/{}] {}", index + 1, total, url);

        match fetcher.fetch(url).await {
            Outcome::Ok(record) => report.records.push(record),
            Outcome::Skipped(skip) => {
                warn!("Skipped {} ({}): {}", skip.url, skip.kind, skip.reason);
                report.skipped.push(skip);
            }
            Outcome::Fatal(e) => {
                error!("Fatal error on {}: {}", url, e);
                report.aborted = Some(e);
                break;
            }
        }
    }

    report.finished_at = Local::now();
    info!("{}", report.summary());
    report
}

/// Chrome を起動して実行するスクレイパー
pub struct SchoolScraper {
    profile: SiteProfile,
    options: RunOptions,
    cancel: CancelFlag,
}

impl SchoolScraper {
    pub fn new(profile: SiteProfile, options: RunOptions) -> Self {
        Self {
            profile: profile.with_overrides(&options),
            options,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }

    /// ブラウザは成功・失敗にかかわらず必ず閉じる
    pub async fn run(&self) -> Result<RunReport, ScraperError> {
        let session = ChromeSession::launch(&self.options).await?;

        let result = match session.new_page().await {
            Ok(page) => Ok(run_with_page(&page, &self.profile, &self.options, &self.cancel).await),
            Err(e) => Err(e),
        };

        if let Err(e) = session.close().await {
            warn!("Browser did not close cleanly: {}", e);
        }
        result
    }
}
