//! 学校ディレクトリ スクレイパー
//!
//! JavaScript で描画される学校検索サイトから学校情報 (名称・住所・電話・
//! 対象学年・学区・Web サイト) を集めて CSV に出力する。
//! サイトごとの違いは全て YAML のサイトプロファイルに書き、エンジンは共通。
//!
//! - `profile`: サイトプロファイルの読み込みと検証
//! - `navigation`: 検索ページ → フィルター → 一覧巡回
//! - `detail` / `extract` / `record`: 詳細ページ → フィールド抽出 → レコード
//! - `retry`: 一時的な失敗の再試行
//! - `runner` / `service`: 実行とレポート、tower Service
//!
//! # 使用例
//!
//! ```rust,ignore
//! use school_scraper::{ScrapeRequest, ScraperService};
//! use tower::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut service = ScraperService::new();
//!
//!     let request = ScrapeRequest::new("profiles/tx_schools.yaml")
//!         .with_output_path("data/tx.csv")
//!         .with_max_items(20);
//!
//!     let result = service.call(request).await.unwrap();
//!     println!("{}", result.report.summary());
//! }
//! ```

pub mod browser;
pub mod config;
pub mod detail;
pub mod error;
pub mod export;
pub mod extract;
pub mod locator;
pub mod navigation;
pub mod profile;
pub mod record;
pub mod retry;
pub mod runner;
pub mod service;
pub mod snapshot;
pub mod traits;
pub mod xpath;

#[cfg(test)]
mod testing;

// 主要な型をリエクスポート
pub use browser::{ChromePage, ChromeSession};
pub use config::RunOptions;
pub use detail::DetailFetcher;
pub use error::{Outcome, ScraperError, Skip, SkipKind};
pub use export::CsvExporter;
pub use extract::{extract, Extraction, FieldMissing};
pub use locator::Locator;
pub use navigation::{Listing, NavigationCursor, Navigator, SessionState};
pub use profile::SiteProfile;
pub use record::{assemble, PartialRecord, SchoolRecord};
pub use retry::{with_retry, RetryPolicy};
pub use runner::{run_with_page, CancelFlag, RunReport, RunStatus, SchoolScraper};
pub use service::{ScrapeRequest, ScrapeResult, ScraperService};
pub use snapshot::PageSnapshot;
pub use traits::BrowserPage;
