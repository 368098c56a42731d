//! ナビゲーション制御
//!
//! 検索ページの読み込み → フィルター適用 → 一覧ページの巡回 を行い、
//! 詳細ページへのリンクを発見順・重複なしで集める。
//! `listing_rows` があれば各ページの表の行も合わせて集める。
//!
//! ```text
//! Init ──▶ Filtering ──▶ Listing ──▶ Done
//!   └──────────────────────▲
//! ```

use std::collections::HashSet;
use std::slice;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ScraperError;
use crate::extract::{extract_rows, ListingRow};
use crate::locator::Locator;
use crate::profile::{LinkRule, Pagination, SiteProfile};
use crate::snapshot::{is_disabled, PageSnapshot};
use crate::traits::BrowserPage;

/// 巡回位置と収集済みリンク。実行ごとに作り直し、永続化しない
#[derive(Debug, Clone, Default)]
pub struct NavigationCursor {
    pub page: u32,
    pub bucket: Option<String>,
    pub known_total: Option<u32>,
    visited: HashSet<String>,
    ordered: Vec<String>,
    row_keys: HashSet<String>,
    rows: Vec<ListingRow>,
}

impl NavigationCursor {
    pub fn new(start_page: u32) -> Self {
        Self {
            page: start_page,
            ..Default::default()
        }
    }

    /// 未訪問なら追加して true
    pub fn admit(&mut self, url: &str) -> bool {
        if self.visited.insert(url.to_string()) {
            self.ordered.push(url.to_string());
            true
        } else {
            false
        }
    }

    /// 未収集の行なら追加して true
    pub fn admit_row(&mut self, row: &ListingRow) -> bool {
        if self.row_keys.insert(row.key()) {
            self.rows.push(row.clone());
            true
        } else {
            false
        }
    }

    pub fn links(&self) -> &[String] {
        &self.ordered
    }

    pub fn rows(&self) -> &[ListingRow] {
        &self.rows
    }

    /// リンクと行のうち多い方の件数
    pub fn collected(&self) -> usize {
        self.ordered.len().max(self.rows.len())
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    fn into_parts(self) -> (Vec<String>, Vec<ListingRow>) {
        (self.ordered, self.rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Filtering,
    Listing,
    Done,
}

/// 一覧巡回の結果
#[derive(Debug)]
pub struct Listing {
    /// 発見順のリンク
    pub links: Vec<String>,
    /// 一覧表の行 (`listing_rows` がないときは空)
    pub rows: Vec<ListingRow>,
    pub pages_visited: u32,
    /// フィルターが適用された状態で一覧を取ったか
    pub filtered: bool,
    /// 巡回を途中で打ち切った理由 (収集済みのリンクは `links` に残る)
    pub error: Option<ScraperError>,
}

/// 一覧ページ1枚分の観察結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageView {
    pub links: Vec<String>,
    pub rows: Vec<ListingRow>,
    /// 有効な「次へ」コントロール
    pub next: Option<Locator>,
    pub total: Option<u32>,
}

/// スナップショットから詳細リンク・次ページ・総ページ数を読み取る
pub fn inspect(snapshot: &PageSnapshot, profile: &SiteProfile) -> PageView {
    let doc = snapshot.document();
    let mut view = PageView {
        links: links_on_page(snapshot, profile.links()),
        rows: profile
            .listing_rows()
            .map(|rule| extract_rows(snapshot, rule, profile))
            .unwrap_or_default(),
        ..Default::default()
    };

    if let Pagination::Next { selectors, total } = profile.pagination() {
        view.next = selectors
            .iter()
            .find(|loc| doc.select(loc).iter().any(|el| !is_disabled(el)))
            .cloned();

        if let Some(total) = total {
            view.total = total
                .selectors
                .iter()
                .flat_map(|loc| doc.texts(loc))
                .find_map(|text| total.parse(&text));
        }
    }

    view
}

/// 詳細リンクを抽出する。最初にリンクを返した候補を採用し、
/// 絶対 URL 化・フィルター・ページ内重複除去を行う
pub fn links_on_page(snapshot: &PageSnapshot, rule: &LinkRule) -> Vec<String> {
    let doc = snapshot.document();
    for locator in &rule.selectors {
        let mut seen = HashSet::new();
        let links: Vec<String> = doc
            .attrs(locator, "href")
            .iter()
            .filter_map(|href| doc.absolute_url(href))
            .filter(|url| rule.accepts(url))
            .filter(|url| seen.insert(url.clone()))
            .collect();
        if !links.is_empty() {
            debug!("Link candidate {} matched {} links", locator, links.len());
            return links;
        }
    }
    Vec::new()
}

pub struct Navigator<'a, P: BrowserPage + ?Sized> {
    page: &'a P,
    profile: &'a SiteProfile,
    cursor: NavigationCursor,
    state: SessionState,
    pages_visited: u32,
    filtered: bool,
}

impl<'a, P: BrowserPage + ?Sized> Navigator<'a, P> {
    pub fn new(page: &'a P, profile: &'a SiteProfile) -> Self {
        let start = match profile.pagination() {
            Pagination::PageIndex { start } => *start,
            _ => 1,
        };
        Self {
            page,
            profile,
            cursor: NavigationCursor::new(start),
            state: SessionState::Init,
            pages_visited: 0,
            filtered: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cursor(&self) -> &NavigationCursor {
        &self.cursor
    }

    /// 状態機械を Done まで進める
    ///
    /// 検索ページが開けない場合のみ Err。一覧途中の失敗は `Listing::error` に入る。
    pub async fn run(mut self) -> Result<Listing, ScraperError> {
        let mut error = None;

        loop {
            match self.state {
                SessionState::Init => {
                    info!(
                        "Loading search page for '{}' ({} pagination)",
                        self.profile.site(),
                        self.profile.pagination().mode()
                    );
                    self.load_search(self.cursor.page).await?;
                    self.state = if self.profile.filters().is_empty() {
                        SessionState::Listing
                    } else {
                        SessionState::Filtering
                    };
                }
                SessionState::Filtering => {
                    match self.apply_filters().await {
                        Ok(()) => {
                            info!("Filters applied");
                            self.filtered = true;
                        }
                        Err(e) => {
                            warn!("Filter step skipped, continuing unfiltered: {}", e);
                            self.load_search(self.cursor.page).await?;
                        }
                    }
                    self.state = SessionState::Listing;
                }
                SessionState::Listing => {
                    let profile = self.profile;
                    let result = match profile.pagination() {
                        Pagination::Alphabetical { bucket, letters, all } => {
                            self.list_alphabetical(bucket, letters, all).await
                        }
                        _ => self.list_sequential().await,
                    };
                    if let Err(e) = result {
                        warn!(
                            "Listing stopped after {} links: {}",
                            self.cursor.len(),
                            e
                        );
                        error = Some(e);
                    }
                    self.state = SessionState::Done;
                }
                SessionState::Done => break,
            }
        }

        let pages_visited = self.pages_visited;
        let filtered = self.filtered;
        let (mut links, mut rows) = self.cursor.into_parts();
        if let Some(max_items) = self.profile.limits().max_items {
            links.truncate(max_items);
            rows.truncate(max_items);
        }
        info!(
            "Listing done: {} links, {} rows from {} pages",
            links.len(),
            rows.len(),
            pages_visited
        );

        Ok(Listing {
            links,
            rows,
            pages_visited,
            filtered,
            error,
        })
    }

    /// 検索ページを開き、描画完了を待つ
    async fn load_search(&self, page_number: u32) -> Result<(), ScraperError> {
        let url = self.profile.search_url(page_number);
        let page = self.page;
        let profile = self.profile;
        let target = url.as_str();

        profile
            .retry_policy()
            .run("load search page", move || async move {
                page.goto(target, profile.page_load_timeout()).await?;
                if !profile.page_ready().is_empty() {
                    page.wait_for(profile.page_ready(), profile.element_wait_timeout())
                        .await?;
                }
                Ok(())
            })
            .await?;

        self.dismiss_overlays().await;
        Ok(())
    }

    /// オーバーレイ・クッキーバナーを閉じる (失敗は無視)
    async fn dismiss_overlays(&self) {
        for locator in self.profile.dismiss() {
            match self.page.click(locator).await {
                Ok(()) => debug!("Dismissed overlay {}", locator),
                Err(e) => debug!("No overlay for {}: {}", locator, e),
            }
        }
    }

    async fn click_with_retry(
        &self,
        operation: &str,
        candidates: &[Locator],
    ) -> Result<Locator, ScraperError> {
        let page = self.page;
        self.profile
            .retry_policy()
            .run(operation, move || async move { page.click_first(candidates).await })
            .await
    }

    async fn apply_filters(&self) -> Result<(), ScraperError> {
        for filter in self.profile.filters() {
            if !filter.expand.is_empty() {
                if let Err(e) = self.page.click_first(&filter.expand).await {
                    debug!("Filter '{}' expand control not clicked: {}", filter.name, e);
                }
            }

            for option in &filter.options {
                let control = filter.control_for(option);
                self.click_with_retry(
                    &format!("filter {}={}", filter.name, option),
                    slice::from_ref(&control),
                )
                .await
                .map_err(|e| {
                    ScraperError::FilterApply(format!("{}={}: {}", filter.name, option, e))
                })?;
                debug!("Selected filter {}={}", filter.name, option);
            }

            if !filter.apply.is_empty() {
                self.click_with_retry(&format!("apply filter {}", filter.name), &filter.apply)
                    .await
                    .map_err(|e| ScraperError::FilterApply(format!("{}: {}", filter.name, e)))?;
            }
        }

        if !self.profile.apply_filters().is_empty() {
            self.click_with_retry("apply filters", self.profile.apply_filters())
                .await
                .map_err(|e| ScraperError::FilterApply(e.to_string()))?;
        }

        self.page.wait_stable(self.profile.stable_timeout()).await
    }

    fn caps_reached(&self) -> bool {
        let limits = self.profile.limits();
        if let Some(max_pages) = limits.max_pages {
            if self.pages_visited >= max_pages {
                info!("Reached max pages ({}), stopping", max_pages);
                return true;
            }
        }
        if let Some(max_items) = limits.max_items {
            if self.cursor.collected() >= max_items {
                info!("Reached max items ({}), stopping", max_items);
                return true;
            }
        }
        false
    }

    /// 現在表示中の一覧を読み取る
    async fn observe(&self) -> Result<PageView, ScraperError> {
        // 空のページ (該当なし) もありうるので、待機のタイムアウトは失敗にしない
        if let Err(e) = self
            .page
            .wait_for(&self.profile.links().selectors, self.profile.element_wait_timeout())
            .await
        {
            debug!("No detail links appeared: {}", e);
        }
        self.page.wait_stable(self.profile.stable_timeout()).await?;

        let page = self.page;
        let snapshot = self
            .profile
            .retry_policy()
            .run("snapshot listing", move || async move { page.snapshot().await })
            .await?;
        Ok(inspect(&snapshot, self.profile))
    }

    /// 収集したリンク・行を取り込む
    ///
    /// 新しいリンクも行も1件も増えないページは進んでいないとみなす。
    /// 空のページは `empty_is_stuck` のときだけ (「次へ」モードの2ページ目以降) 対象。
    fn record_page(&mut self, view: &PageView, empty_is_stuck: bool) -> Result<(), ScraperError> {
        self.pages_visited += 1;

        let added = view.links.iter().filter(|l| self.cursor.admit(l)).count();
        let added_rows = view.rows.iter().filter(|r| self.cursor.admit_row(r)).count();
        info!(
            "Page {}{}: {} links ({} new, {} total)",
            self.cursor.page,
            self.cursor
                .bucket
                .as_deref()
                .map(|b| format!(" [{}]", b))
                .unwrap_or_default(),
            view.links.len(),
            added,
            self.cursor.len()
        );
        if !view.rows.is_empty() {
            debug!(
                "Page {}: {} rows ({} new)",
                self.cursor.page,
                view.rows.len(),
                added_rows
            );
        }

        let stalled = if view.links.is_empty() && view.rows.is_empty() {
            empty_is_stuck && self.pages_visited > 1
        } else {
            added + added_rows == 0
        };
        if stalled {
            return Err(ScraperError::PaginationStuck {
                page: self.pages_visited,
                collected: self.cursor.collected(),
            });
        }
        Ok(())
    }

    /// 「次へ」・ページ番号・単一ページ
    async fn list_sequential(&mut self) -> Result<(), ScraperError> {
        let profile = self.profile;
        loop {
            if self.caps_reached() {
                return Ok(());
            }

            let view = self.observe().await?;
            if self.cursor.known_total.is_none() {
                if let Some(total) = view.total {
                    debug!("Total pages: {}", total);
                    self.cursor.known_total = Some(total);
                }
            }
            let next_mode = matches!(profile.pagination(), Pagination::Next { .. });
            self.record_page(&view, next_mode)?;

            if self.caps_reached() {
                return Ok(());
            }

            match profile.pagination() {
                Pagination::Next { .. } => {
                    if let Some(total) = self.cursor.known_total {
                        if self.cursor.page >= total {
                            debug!("Last page ({}) reached", total);
                            return Ok(());
                        }
                    }
                    let next = match view.next {
                        Some(next) => next,
                        None => {
                            debug!("No enabled next control on page {}", self.cursor.page);
                            return Ok(());
                        }
                    };
                    sleep(self.profile.request_delay()).await;
                    self.click_with_retry("next page", slice::from_ref(&next))
                        .await?;
                    self.cursor.page += 1;
                }
                Pagination::PageIndex { .. } => {
                    if view.links.is_empty() && view.rows.is_empty() {
                        debug!("Empty page {}, stopping", self.cursor.page);
                        return Ok(());
                    }
                    sleep(self.profile.request_delay()).await;
                    self.cursor.page += 1;
                    self.load_search(self.cursor.page).await?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// 頭文字ごとの一覧。`all` で全件表示できればそれだけで終える
    async fn list_alphabetical(
        &mut self,
        bucket: &Locator,
        letters: &[String],
        all: &[Locator],
    ) -> Result<(), ScraperError> {
        if !all.is_empty() {
            match self.page.click_first(all).await {
                Ok(clicked) => {
                    debug!("Clicked show-all control {}", clicked);
                    self.cursor.bucket = Some("ALL".to_string());
                    let view = self.observe().await?;
                    if !view.links.is_empty() || !view.rows.is_empty() {
                        return self.record_page(&view, false);
                    }
                    debug!("Show-all produced no links, falling back to letters");
                }
                Err(e) => debug!("No show-all control: {}", e),
            }
        }

        for letter in letters {
            if self.caps_reached() {
                return Ok(());
            }

            self.cursor.bucket = Some(letter.clone());
            let control = bucket.fill("letter", letter);
            if let Err(e) = self
                .click_with_retry(&format!("bucket {}", letter), slice::from_ref(&control))
                .await
            {
                warn!("Bucket '{}' not available: {}", letter, e);
                continue;
            }

            let view = self.observe().await?;
            self.record_page(&view, false)?;
            self.cursor.page += 1;
            sleep(self.profile.request_delay()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
base_url: https://example.test/search
pagination:
  next:
    selectors: ["button.next", "text=Next"]
    total:
      selectors: [".info"]
      regex: 'of\s+(\d+)'
links:
  selectors: ["table a.school", "a"]
  include: '/schools/\d+'
  exclude: ["/report"]
fields:
  name: {selectors: ["h1"]}
output:
  columns: [name, source_url]
"#;

    fn profile() -> SiteProfile {
        SiteProfile::from_yaml_str(PROFILE).unwrap()
    }

    #[test]
    fn test_cursor_dedupes_in_discovery_order() {
        let mut cursor = NavigationCursor::new(1);
        assert!(cursor.admit("https://x/schools/2"));
        assert!(cursor.admit("https://x/schools/1"));
        assert!(!cursor.admit("https://x/schools/2"));
        assert_eq!(cursor.links(), ["https://x/schools/2", "https://x/schools/1"]);
    }

    #[test]
    fn test_inspect_reads_links_next_and_total() {
        let snap = PageSnapshot::new(
            "https://example.test/search",
            r##"<table>
                 <tr><td><a class="school" href="/schools/1">One</a></td></tr>
                 <tr><td><a class="school" href="/schools/1">One again</a></td></tr>
                 <tr><td><a class="school" href="/schools/2/report">Report</a></td></tr>
                 <tr><td><a class="school" href="/schools/3">Three</a></td></tr>
               </table>
               <span class="info">Page 1 of 4</span>
               <button class="next" disabled>Next</button>
               <a href="#">Next</a>"##,
        );
        let view = inspect(&snap, &profile());
        assert_eq!(
            view.links,
            vec![
                "https://example.test/schools/1",
                "https://example.test/schools/3"
            ]
        );
        assert_eq!(view.total, Some(4));
        assert_eq!(
            view.next,
            Some(Locator::Text {
                text: "Next".into(),
                tag: None,
                exact: false
            })
        );
    }

    #[test]
    fn test_links_fall_back_to_later_candidate() {
        let snap = PageSnapshot::new(
            "https://example.test/search",
            r#"<ul><li><a href="/schools/9">Nine</a></li><li><a href="/about">About</a></li></ul>"#,
        );
        assert_eq!(
            links_on_page(&snap, profile().links()),
            vec!["https://example.test/schools/9"]
        );
    }

    mod with_site {
        use super::super::*;
        use crate::config::RunOptions;
        use crate::testing::{
            listing, next_button, profile, url, FakeSite, DETAIL_RULES, LAST_PAGE, NEXT_PAGINATION,
        };

        fn school(id: u32) -> String {
            url(&format!("/schools/{}", id))
        }

        fn two_pages() -> FakeSite {
            FakeSite::new()
                .page("/search", &listing(&[1, 2, 3], &next_button("/search?page=2")))
                .page("/search?page=2", &listing(&[3, 4, 5], LAST_PAGE))
        }

        #[tokio::test]
        async fn test_next_pagination_collects_in_discovery_order() {
            let site = two_pages();
            let profile = profile(&format!("{}{}", DETAIL_RULES, NEXT_PAGINATION));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(
                listing.links,
                (1..=5).map(school).collect::<Vec<_>>()
            );
            assert_eq!(listing.pages_visited, 2);
            assert!(listing.error.is_none());
            assert!(!listing.filtered);
        }

        #[tokio::test]
        async fn test_stuck_pagination_keeps_collected_links() {
            let site = FakeSite::new()
                .page("/search", &listing(&[1, 2, 3], &next_button("/search?page=2")))
                .page("/search?page=2", &listing(&[1, 2, 3], &next_button("/search?page=3")));
            let profile = profile(&format!("{}{}", DETAIL_RULES, NEXT_PAGINATION));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(listing.links.len(), 3);
            assert!(matches!(
                listing.error,
                Some(ScraperError::PaginationStuck {
                    page: 2,
                    collected: 3
                })
            ));
        }

        fn assert_stuck(listing: &Listing, page: u32, collected: usize) {
            match &listing.error {
                Some(ScraperError::PaginationStuck {
                    page: p,
                    collected: c,
                }) => {
                    assert_eq!((*p, *c), (page, collected));
                }
                other => panic!("expected PaginationStuck, got {:?}", other),
            }
            assert_eq!(listing.links.len(), collected);
        }

        #[tokio::test]
        async fn test_cycling_next_control_stops() {
            let site = FakeSite::new()
                .page("/search", &listing(&[1, 2], &next_button("/search?page=2")))
                .page("/search?page=2", &listing(&[3, 4], &next_button("/search")));
            let profile = profile(&format!("{}{}", DETAIL_RULES, NEXT_PAGINATION));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_stuck(&listing, 3, 4);
            assert_eq!(listing.links, (1..=4).map(school).collect::<Vec<_>>());
        }

        #[tokio::test]
        async fn test_empty_page_with_enabled_next_stops() {
            let site = FakeSite::new()
                .page("/search", &listing(&[1, 2, 3], &next_button("/search?page=2")))
                .page("/search?page=2", &listing(&[], &next_button("/search?page=2")));
            let profile = profile(&format!("{}{}", DETAIL_RULES, NEXT_PAGINATION));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_stuck(&listing, 2, 3);
            assert_eq!(site.clicks().len(), 1);
        }

        #[tokio::test]
        async fn test_reordered_repeat_page_is_stuck() {
            let site = FakeSite::new()
                .page("/search", &listing(&[1, 2, 3], &next_button("/search?page=2")))
                .page("/search?page=2", &listing(&[3, 2, 1], &next_button("/search?page=3")));
            let profile = profile(&format!("{}{}", DETAIL_RULES, NEXT_PAGINATION));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_stuck(&listing, 2, 3);
        }

        #[tokio::test]
        async fn test_page_index_walks_until_empty_page() {
            let site = FakeSite::new()
                .page("/search?page=1", &listing(&[1, 2], ""))
                .page("/search?page=2", &listing(&[3], ""))
                .page("/search?page=3", &listing(&[], ""));
            let profile = profile(&format!(
                "search_url: \"/search?page={{page}}\"\npagination:\n  page_index: {{start: 1}}\n{}",
                DETAIL_RULES
            ));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(listing.links, (1..=3).map(school).collect::<Vec<_>>());
            assert_eq!(listing.pages_visited, 3);
            assert!(listing.error.is_none());
            assert_eq!(
                site.gotos(),
                vec![
                    url("/search?page=1"),
                    url("/search?page=2"),
                    url("/search?page=3")
                ]
            );
        }

        #[tokio::test]
        async fn test_next_stops_at_known_total() {
            let total = r#"<span class="info">Page 1 of 2</span>"#;
            let site = FakeSite::new()
                .page(
                    "/search",
                    &listing(&[1], &format!("{}{}", total, next_button("/search?page=2"))),
                )
                .page(
                    "/search?page=2",
                    &listing(&[2], &format!("{}{}", total, next_button("/search?page=3"))),
                )
                .page("/search?page=3", &listing(&[3], ""));
            let profile = profile(&format!(
                "{}pagination:\n  next:\n    selectors: [\"button.next\"]\n    total:\n      selectors: [\".info\"]\n      regex: 'of\\s+(\\d+)'\n",
                DETAIL_RULES
            ));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(listing.links, vec![school(1), school(2)]);
            assert_eq!(listing.pages_visited, 2);
            assert_eq!(site.clicks().len(), 1);
            assert!(listing.error.is_none());
        }

        #[tokio::test]
        async fn test_dismiss_clicks_present_overlays_only() {
            let site = FakeSite::new().page(
                "/search",
                &listing(&[1], r#"<button class="overlay-close">x</button>"#),
            );
            let profile = profile(&format!(
                "{}dismiss: [\"button.overlay-close\", \"button.cookie-accept\"]\n",
                DETAIL_RULES
            ));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(listing.links, vec![school(1)]);
            assert!(listing.error.is_none());
            let clicks = site.clicks();
            assert_eq!(clicks.len(), 1);
            assert!(clicks[0].contains("overlay-close"));
        }

        #[tokio::test]
        async fn test_rows_count_as_progress() {
            let rows = r#"<table><tbody>
                            <tr><td class="name">Alamo El</td></tr>
                            <tr><td class="name">Bowie High</td></tr>
                          </tbody></table>"#;
            let site = FakeSite::new()
                .page("/search", &format!("{}{}", rows, next_button("/search?page=2")))
                .page("/search?page=2", &format!("{}{}", rows, next_button("/search?page=3")));
            let profile = profile(&format!(
                "{}{}listing_rows:\n  row: \"tbody tr\"\n  fields:\n    name: {{selectors: [\"td.name\"]}}\n",
                DETAIL_RULES, NEXT_PAGINATION
            ));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert!(listing.links.is_empty());
            assert_eq!(listing.rows.len(), 2);
            assert_eq!(listing.rows[0].extraction.record.get("name"), Some("Alamo El"));
            assert!(matches!(
                listing.error,
                Some(ScraperError::PaginationStuck { page: 2, .. })
            ));
        }

        #[tokio::test]
        async fn test_max_pages_stops_without_error() {
            let site = two_pages();
            let profile = profile(&format!("{}{}", DETAIL_RULES, NEXT_PAGINATION))
                .with_overrides(&RunOptions::new().with_max_pages(1));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(listing.links, (1..=3).map(school).collect::<Vec<_>>());
            assert_eq!(listing.pages_visited, 1);
            assert!(listing.error.is_none());
        }

        #[tokio::test]
        async fn test_max_items_truncates_links() {
            let site = two_pages();
            let profile = profile(&format!("{}{}", DETAIL_RULES, NEXT_PAGINATION))
                .with_overrides(&RunOptions::new().with_max_items(4));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(listing.links, (1..=4).map(school).collect::<Vec<_>>());
            assert!(listing.error.is_none());
        }

        fn filtered_site() -> FakeSite {
            FakeSite::new()
                .page(
                    "/search",
                    &listing(
                        &[1],
                        r#"<label data-option="K">K</label>
                           <button class="apply" data-goto="/search?grade=K">Apply</button>"#,
                    ),
                )
                .page("/search?grade=K", &listing(&[7], ""))
        }

        fn filter_rules(option: &str) -> String {
            format!(
                "{}\nfilters:\n  grade:\n    control: \"label[data-option='{{option}}']\"\n    options: [{}]\napply_filters: [\"button.apply\"]\n",
                DETAIL_RULES, option
            )
        }

        #[tokio::test]
        async fn test_filters_narrow_the_listing() {
            let site = filtered_site();
            let profile = profile(&filter_rules("K"));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert!(listing.filtered);
            assert_eq!(listing.links, vec![school(7)]);
            assert_eq!(site.gotos(), vec![url("/search")]);
        }

        #[tokio::test]
        async fn test_filter_failure_continues_unfiltered() {
            let site = filtered_site();
            let profile = profile(&filter_rules("Z"));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert!(!listing.filtered);
            assert!(listing.error.is_none());
            assert_eq!(listing.links, vec![school(1)]);
            // フィルター失敗後に検索ページを開き直す
            assert_eq!(site.gotos(), vec![url("/search"), url("/search")]);
        }

        const ALPHABETICAL: &str = r#"
pagination:
  alphabetical:
    bucket: "button[value='{letter}']"
    letters: [A, B, C]
    all: ["button[value='ALL']"]
"#;

        const LETTER_BAR: &str = r#"
            <button value="ALL" data-goto="/search?letter=ALL">ALL</button>
            <button value="A" data-goto="/search?letter=A">A</button>
            <button value="B" data-goto="/search?letter=B">B</button>"#;

        #[tokio::test]
        async fn test_alphabetical_falls_back_to_letters() {
            let site = FakeSite::new()
                .page("/search", &listing(&[], LETTER_BAR))
                .page("/search?letter=ALL", &listing(&[], LETTER_BAR))
                .page("/search?letter=A", &listing(&[1, 2], LETTER_BAR))
                .page("/search?letter=B", &listing(&[2, 3], LETTER_BAR));
            let profile = profile(&format!("{}{}", DETAIL_RULES, ALPHABETICAL));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(listing.links, (1..=3).map(school).collect::<Vec<_>>());
            assert_eq!(listing.pages_visited, 2);
            // C のボタンはないので読み飛ばす
            assert!(listing.error.is_none());
            assert!(!site.clicks().iter().any(|c| c.contains("'C'")));
        }

        #[tokio::test]
        async fn test_alphabetical_uses_show_all_when_available() {
            let site = FakeSite::new()
                .page("/search", &listing(&[], LETTER_BAR))
                .page("/search?letter=ALL", &listing(&[4, 5, 6], LETTER_BAR));
            let profile = profile(&format!("{}{}", DETAIL_RULES, ALPHABETICAL));

            let listing = Navigator::new(&site, &profile).run().await.unwrap();
            assert_eq!(listing.links, (4..=6).map(school).collect::<Vec<_>>());
            assert_eq!(site.clicks().len(), 1);
        }

        #[tokio::test]
        async fn test_unreachable_search_page_is_an_error() {
            let site = FakeSite::new();
            let profile = profile(DETAIL_RULES);

            let err = Navigator::new(&site, &profile).run().await.unwrap_err();
            assert!(matches!(err, ScraperError::RetriesExhausted { attempts: 3, .. }));
            assert_eq!(site.gotos().len(), 3);
        }
    }

    #[test]
    fn test_no_next_when_all_disabled() {
        let snap = PageSnapshot::new(
            "https://example.test/search",
            r#"<button class="next v-btn--disabled">Next</button>"#,
        );
        let view = inspect(&snap, &profile());
        assert_eq!(view.next, None);
        assert!(view.links.is_empty());
    }
}
