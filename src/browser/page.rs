use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ScraperError;
use crate::locator::{Locator, Selection, TextMatch};
use crate::snapshot::PageSnapshot;
use crate::traits::BrowserPage;

/// 要素待機のポーリング間隔
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// DOM 安定判定の間隔
const SETTLE_INTERVAL: Duration = Duration::from_millis(300);
/// 同じ DOM 署名がこの回数続けば安定
const SETTLE_STREAK: u32 = 3;

/// 要素数と HTML 長からなる DOM の署名
const DOM_SIGNATURE_JS: &str =
    "document.getElementsByTagName('*').length + ':' + document.documentElement.outerHTML.length";

/// 期限付きのポーリング
struct Deadline {
    start: Instant,
    timeout: Duration,
    interval: Duration,
}

impl Deadline {
    fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
            interval,
        }
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// 期限内なら1間隔待って true。期限切れなら待たずに false
    async fn tick(&self) -> bool {
        if self.start.elapsed() >= self.timeout {
            return false;
        }
        sleep(self.interval).await;
        true
    }
}

/// DOM 署名の連続一致を数える
#[derive(Debug, Default)]
struct Settle {
    last: Option<String>,
    streak: u32,
}

impl Settle {
    /// 署名を1つ取り込み、安定したら true
    fn observe(&mut self, signature: Option<String>) -> bool {
        match signature {
            Some(sig) if self.last.as_deref() == Some(sig.as_str()) => self.streak += 1,
            Some(sig) => {
                self.last = Some(sig);
                self.streak = 0;
            }
            None => {
                self.last = None;
                self.streak = 0;
            }
        }
        self.streak >= SETTLE_STREAK
    }
}

/// ブラウザ側でロケーターを評価するスクリプト。
/// スナップショット側 (`snapshot::Document::select`) と同じ規則で要素を選ぶ
const FIND_ELEMENTS_JS: &str = r#"
  const norm = s => (s || '').replace(/\s+/g, ' ').trim();
  let found = [];
  if (q.kind === 'path') {
    const r = document.evaluate(q.path, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
    for (let i = 0; i < r.snapshotLength; i++) {
      const n = r.snapshotItem(i);
      if (n.nodeType === 1) found.push(n);
    }
  } else {
    found = Array.from(document.querySelectorAll(q.css));
    if (q.text) {
      const hit = found.filter(el => {
        const t = norm(el.textContent);
        return q.text.exact ? t === q.text.needle : t.includes(q.text.needle);
      });
      found = hit.filter(el => !hit.some(o => o !== el && el.contains(o)));
    }
  }
  const isDisabled = el => el.disabled === true
    || (el.getAttribute('aria-disabled') || '').toLowerCase() === 'true'
    || (typeof el.className === 'string' && el.className.toLowerCase().includes('disabled'));
"#;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsQuery<'a> {
    Css {
        css: &'a str,
        text: Option<&'a TextMatch>,
    },
    Path {
        path: &'a str,
    },
}

/// chromiumoxide のページ
pub struct ChromePage {
    page: Page,
    debug: bool,
}

impl ChromePage {
    pub(crate) fn new(page: Page, debug: bool) -> Self {
        Self { page, debug }
    }

    /// ロケーターで要素を選び、`action` を評価するスクリプトを組み立てる
    fn locator_script(locator: &Locator, action: &str) -> Result<String, ScraperError> {
        let selection = locator.selection()?;
        let query = match &selection {
            Selection::Css { css, text } => JsQuery::Css {
                css,
                text: text.as_ref(),
            },
            Selection::Path(_) => match locator {
                Locator::Path(path) => JsQuery::Path { path },
                _ => return Err(ScraperError::config(format!("不明なロケーター: {}", locator))),
            },
        };
        let json = serde_json::to_string(&query)
            .map_err(|e| ScraperError::JavaScript(format!("クエリ生成失敗: {}", e)))?;
        Ok(format!(
            "(() => {{ const q = {}; {} {} }})()",
            json, FIND_ELEMENTS_JS, action
        ))
    }

    async fn eval_bool(&self, script: String) -> Result<bool, ScraperError> {
        let result = self
            .page
            .evaluate(script.as_str())
            .await
            .map_err(|e| classify(e, "evaluate", ScraperError::JavaScript))?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn exists(&self, locator: &Locator) -> Result<bool, ScraperError> {
        let script = Self::locator_script(locator, "return found.length > 0;")?;
        self.eval_bool(script).await
    }

    /// 候補のうち最初に存在するもの。再試行できるエラーは「未出現」扱い
    async fn first_present(
        &self,
        candidates: &[Locator],
    ) -> Result<Option<Locator>, ScraperError> {
        for locator in candidates {
            match self.exists(locator).await {
                Ok(true) => return Ok(Some(locator.clone())),
                Ok(false) => {}
                Err(e) if e.is_retryable() => debug!("Wait check error: {}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn dom_signature(&self) -> Option<String> {
        match self.page.evaluate(DOM_SIGNATURE_JS).await {
            Ok(val) => val.into_value::<String>().ok(),
            Err(e) => {
                debug!("DOM signature unavailable: {}", e);
                None
            }
        }
    }

    async fn ready_state(&self) -> Result<String, ScraperError> {
        let state = self
            .page
            .evaluate("document.readyState")
            .await
            .map_err(|e| classify(e, "readyState", ScraperError::JavaScript))?;
        Ok(state.into_value::<String>().unwrap_or_default())
    }

    async fn log_screenshot(&self, context: &str) {
        if !self.debug {
            return;
        }
        match self
            .page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
        {
            Ok(png) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
                debug!("{} screenshot: data:image/png;base64,{}", context, encoded);
            }
            Err(e) => debug!("{} screenshot failed: {}", context, e),
        }
    }
}

#[async_trait]
impl BrowserPage for ChromePage {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), ScraperError> {
        debug!("Navigating to {}", url);
        let deadline = Deadline::new(timeout, POLL_INTERVAL);

        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(classify(e, url, ScraperError::Navigation)),
            Err(_) => {
                return Err(ScraperError::Timeout(format!(
                    "ページ読み込みが{:?}以内に完了しませんでした: {}",
                    timeout, url
                )))
            }
        }

        // ページの完全なロードを待機
        loop {
            if self.ready_state().await? == "complete" {
                debug!("Page load complete after {:?}", deadline.elapsed());
                return Ok(());
            }
            if !deadline.tick().await {
                break;
            }
        }

        Err(ScraperError::Timeout(format!(
            "document.readyState が complete になりません: {}",
            url
        )))
    }

    async fn wait_for(
        &self,
        candidates: &[Locator],
        timeout: Duration,
    ) -> Result<Locator, ScraperError> {
        if candidates.is_empty() {
            return Err(ScraperError::ElementNotFound("待機対象がありません".into()));
        }

        let deadline = Deadline::new(timeout, POLL_INTERVAL);
        loop {
            if let Some(found) = self.first_present(candidates).await? {
                debug!("Found {} after {:?}", found, deadline.elapsed());
                return Ok(found);
            }
            if !deadline.tick().await {
                break;
            }
        }

        self.log_screenshot("wait_for").await;
        let names: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
        Err(ScraperError::Timeout(format!(
            "{:?}以内に要素が現れませんでした: {}",
            timeout,
            names.join(", ")
        )))
    }

    /// DOM 署名が続けて変わらなくなるまで待つ。期限切れは警告のみで成功扱い
    async fn wait_stable(&self, timeout: Duration) -> Result<(), ScraperError> {
        let deadline = Deadline::new(timeout, SETTLE_INTERVAL);
        let mut settle = Settle::default();
        loop {
            if settle.observe(self.dom_signature().await) {
                debug!("DOM settled after {:?}", deadline.elapsed());
                return Ok(());
            }
            if !deadline.tick().await {
                break;
            }
        }

        warn!("DOM still changing after {:?}, continuing", deadline.elapsed());
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> Result<(), ScraperError> {
        let script = Self::locator_script(
            locator,
            r#"
            const el = found.find(e => !isDisabled(e));
            if (!el) return false;
            el.scrollIntoView({block: 'center'});
            el.click();
            return true;
            "#,
        )?;

        if self.eval_bool(script).await? {
            debug!("Clicked {}", locator);
            Ok(())
        } else {
            Err(ScraperError::ElementNotFound(format!(
                "クリックできる要素がありません: {}",
                locator
            )))
        }
    }

    async fn snapshot(&self) -> Result<PageSnapshot, ScraperError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| classify(e, "url", ScraperError::JavaScript))?
            .unwrap_or_default();
        let html = self
            .page
            .content()
            .await
            .map_err(|e| classify(e, "content", ScraperError::JavaScript))?;
        Ok(PageSnapshot::new(url, html))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ScraperError> {
        self.page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| classify(e, "screenshot", ScraperError::JavaScript))
    }
}

/// CDP エラーを再試行可否のわかる種類に振り分ける
fn classify(e: CdpError, context: &str, fallback: fn(String) -> ScraperError) -> ScraperError {
    let message = format!("{}: {}", context, e);
    if matches!(e, CdpError::Timeout) {
        return ScraperError::Timeout(message);
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("err_name_not_resolved") {
        ScraperError::Dns(message)
    } else if lower.contains("no node with given id") || lower.contains("detached") {
        ScraperError::StaleElement(message)
    } else if lower.contains("channel") || lower.contains("connection closed") {
        info!("Browser session lost: {}", message);
        ScraperError::BrowserInit(message)
    } else {
        fallback(message)
    }
}
