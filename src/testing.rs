//! テスト用のメモリ上の偽サイト
//!
//! URL → HTML の表を持ち、`data-goto` 属性を持つ要素のクリックでその URL へ移る。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ScraperError;
use crate::locator::Locator;
use crate::profile::SiteProfile;
use crate::runner::CancelFlag;
use crate::snapshot::{is_disabled, PageSnapshot};
use crate::traits::BrowserPage;

pub const ORIGIN: &str = "https://fake.test";

/// 一覧リンク・詳細フィールドの共通ルール
pub const DETAIL_RULES: &str = r#"
links:
  selectors: ["a.school"]
  include: '/schools/\d+'
fields:
  name: {selectors: ["h1"], required: true}
  address: {selectors: [".addr"], pattern: address}
  phone: {selectors: [".phone"]}
patterns:
  address:
    regex: '^(.+?),\s*([^,]+),\s*([A-Z]{2})\s+(\d{5})$'
    groups: [address1, city, state, zip]
output:
  columns: [name, address1, city, state, zip, phone, source_url]
"#;

pub const NEXT_PAGINATION: &str = r#"
pagination:
  next:
    selectors: ["button.next"]
"#;

pub fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
}

/// 待ち時間をなくしたプロファイル。`body` は DETAIL_RULES などを連結したもの
pub fn profile(body: &str) -> SiteProfile {
    let yaml = format!(
        "base_url: {}/search\n{}\ntiming: {{page_load_timeout_ms: 100, element_wait_timeout_ms: 10, request_delay_ms: 0, stable_timeout_ms: 10}}\nretry: {{base_delay_ms: 1}}\n",
        ORIGIN, body
    );
    SiteProfile::from_yaml_str(&yaml).unwrap()
}

/// `ids` の詳細リンクを並べた一覧ページ
pub fn listing(ids: &[u32], extra: &str) -> String {
    let links: String = ids
        .iter()
        .map(|id| format!(r#"<li><a class="school" href="/schools/{id}">School {id}</a></li>"#))
        .collect();
    format!("<html><body><ul>{}</ul>{}</body></html>", links, extra)
}

pub fn detail(id: u32) -> String {
    format!(
        r#"<html><body>
             <h1>School {id}</h1>
             <div class="addr">{id}00 Main St, Austin, TX 78701</div>
             <span class="phone">512.555.01{id:02}</span>
           </body></html>"#
    )
}

pub fn next_button(path: &str) -> String {
    format!(r#"<button class="next" data-goto="{}">Next</button>"#, path)
}

pub const LAST_PAGE: &str = r#"<button class="next" disabled>Next</button>"#;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// 毎回タイムアウト (リトライ対象)
    Timeout,
    /// ブラウザとの接続断
    Crash,
}

#[derive(Default)]
struct State {
    current: Option<String>,
    gotos: Vec<String>,
    clicks: Vec<String>,
}

#[derive(Default)]
pub struct FakeSite {
    pages: HashMap<String, String>,
    failures: HashMap<String, Failure>,
    cancel_on: Option<(String, CancelFlag)>,
    state: Mutex<State>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, path: &str, html: &str) -> Self {
        self.pages.insert(url(path), html.to_string());
        self
    }

    pub fn failing(mut self, path: &str, failure: Failure) -> Self {
        self.failures.insert(url(path), failure);
        self
    }

    /// 指定ページを開いた時点で中断フラグを立てる
    pub fn cancel_on(mut self, path: &str, flag: CancelFlag) -> Self {
        self.cancel_on = Some((url(path), flag));
        self
    }

    pub fn gotos(&self) -> Vec<String> {
        self.state.lock().unwrap().gotos.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().unwrap().clicks.clone()
    }

    fn current(&self) -> Result<PageSnapshot, ScraperError> {
        let state = self.state.lock().unwrap();
        let current = state
            .current
            .clone()
            .ok_or_else(|| ScraperError::Navigation("no page loaded".into()))?;
        let html = self.pages.get(&current).cloned().unwrap_or_default();
        Ok(PageSnapshot::new(current, html))
    }

    /// クリック対象の遷移先。要素がなければ None
    fn resolve_click(snapshot: &PageSnapshot, locator: &Locator) -> Option<Option<String>> {
        let doc = snapshot.document();
        let target = doc
            .select(locator)
            .into_iter()
            .find(|el| !is_disabled(el))?;
        Some(
            target
                .value()
                .attr("data-goto")
                .and_then(|href| doc.absolute_url(href)),
        )
    }

    fn first_present(snapshot: &PageSnapshot, candidates: &[Locator]) -> Option<Locator> {
        let doc = snapshot.document();
        candidates.iter().find(|loc| doc.exists(loc)).cloned()
    }
}

#[async_trait]
impl BrowserPage for FakeSite {
    async fn goto(&self, target: &str, _timeout: Duration) -> Result<(), ScraperError> {
        self.state.lock().unwrap().gotos.push(target.to_string());

        if let Some((path, flag)) = &self.cancel_on {
            if path == target {
                flag.cancel();
            }
        }

        match self.failures.get(target) {
            Some(Failure::Timeout) => {
                return Err(ScraperError::Timeout(format!("goto {}", target)));
            }
            Some(Failure::Crash) => {
                return Err(ScraperError::BrowserInit("connection closed".into()));
            }
            None => {}
        }
        if !self.pages.contains_key(target) {
            return Err(ScraperError::Navigation(format!("404 {}", target)));
        }
        self.state.lock().unwrap().current = Some(target.to_string());
        Ok(())
    }

    async fn wait_for(
        &self,
        candidates: &[Locator],
        _timeout: Duration,
    ) -> Result<Locator, ScraperError> {
        let snapshot = self.current()?;
        Self::first_present(&snapshot, candidates)
            .ok_or_else(|| ScraperError::Timeout("wait_for".into()))
    }

    async fn wait_stable(&self, _timeout: Duration) -> Result<(), ScraperError> {
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> Result<(), ScraperError> {
        let snapshot = self.current()?;
        let next = Self::resolve_click(&snapshot, locator)
            .ok_or_else(|| ScraperError::ElementNotFound(locator.to_string()))?;

        let mut state = self.state.lock().unwrap();
        state.clicks.push(locator.to_string());
        if let Some(next) = next {
            state.current = Some(next);
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<PageSnapshot, ScraperError> {
        self.current()
    }
}
