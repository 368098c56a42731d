use std::time::Duration;

use async_trait::async_trait;

use crate::error::ScraperError;
use crate::locator::Locator;
use crate::snapshot::PageSnapshot;

/// エンジンが必要とするページ操作
///
/// Chrome 実装 (`browser::ChromePage`) のほか、テストではメモリ上の偽サイトが実装する。
/// 1つのページを同時に操作するのは常に1か所だけ。
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// URL を開き、読み込み完了まで待つ
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), ScraperError>;

    /// いずれかの候補が現れるまで待つ。現れた候補を返す
    async fn wait_for(
        &self,
        candidates: &[Locator],
        timeout: Duration,
    ) -> Result<Locator, ScraperError>;

    /// DOM の変化が止まるまで待つ
    async fn wait_stable(&self, timeout: Duration) -> Result<(), ScraperError>;

    /// 一致する最初の (有効な) 要素をクリックする
    async fn click(&self, locator: &Locator) -> Result<(), ScraperError>;

    /// 現在の URL と outerHTML
    async fn snapshot(&self) -> Result<PageSnapshot, ScraperError>;

    /// PNG スクリーンショット (デバッグ用)
    async fn screenshot(&self) -> Result<Vec<u8>, ScraperError> {
        Err(ScraperError::JavaScript(
            "スクリーンショット未対応".to_string(),
        ))
    }

    /// 候補を順にクリックし、最初に成功したものを返す
    async fn click_first(&self, candidates: &[Locator]) -> Result<Locator, ScraperError> {
        let mut last_error = None;
        for locator in candidates {
            match self.click(locator).await {
                Ok(()) => return Ok(locator.clone()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ScraperError::ElementNotFound("クリック候補がありません".to_string())
        }))
    }
}
