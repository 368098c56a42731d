//! サイトプロファイル
//!
//! 1サイト分のナビゲーション・セレクタ・抽出ルールを宣言する YAML 文書。
//! 読み込み時に全て検証し、以降は不変の値として扱う。

use std::collections::BTreeMap;
use std::path::Path;
use std::slice;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::debug;
use url::Url;

use crate::config::RunOptions;
use crate::error::ScraperError;
use crate::locator::Locator;
use crate::record::{is_record_key, COLUMNS};
use crate::retry::{RetryPolicy, INITIAL_BACKOFF_MS, MAX_ATTEMPTS, MAX_BACKOFF_MS};

// ============================================================
// YAML 上の表現
// ============================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    #[serde(default)]
    site: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    search_url: Option<String>,
    #[serde(default)]
    page_ready: Vec<Locator>,
    #[serde(default)]
    dismiss: Vec<Locator>,
    #[serde(default)]
    filters: Mapping,
    #[serde(default)]
    apply_filters: Vec<Locator>,
    #[serde(default)]
    pagination: Option<RawPagination>,
    #[serde(default)]
    links: Option<RawLinks>,
    #[serde(default)]
    listing_rows: Option<RawListingRows>,
    #[serde(default)]
    detail: RawDetail,
    #[serde(default)]
    fields: Mapping,
    #[serde(default)]
    patterns: BTreeMap<String, RawPattern>,
    #[serde(default)]
    defaults: BTreeMap<String, String>,
    #[serde(default)]
    reject_names: Vec<String>,
    #[serde(default)]
    output: RawOutput,
    #[serde(default)]
    timing: RawTiming,
    #[serde(default)]
    retry: RawRetry,
    #[serde(default)]
    limits: Limits,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilter {
    control: Locator,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    expand: Vec<Locator>,
    #[serde(default)]
    apply: Vec<Locator>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPagination {
    #[serde(default)]
    next: Option<RawNext>,
    #[serde(default)]
    alphabetical: Option<RawAlphabetical>,
    #[serde(default)]
    page_index: Option<RawPageIndex>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNext {
    selectors: Vec<Locator>,
    #[serde(default)]
    total: Option<RawTotal>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTotal {
    selectors: Vec<Locator>,
    regex: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAlphabetical {
    bucket: Locator,
    #[serde(default)]
    letters: Option<Vec<String>>,
    #[serde(default)]
    all: Vec<Locator>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPageIndex {
    #[serde(default)]
    start: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLinks {
    selectors: Vec<Locator>,
    #[serde(default)]
    include: Option<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListingRows {
    row: Locator,
    #[serde(default)]
    link: Option<Locator>,
    fields: Mapping,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDetail {
    #[serde(default)]
    ready: Vec<Locator>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    #[serde(default)]
    selectors: Vec<Locator>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    attribute: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    strip: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPattern {
    regex: String,
    groups: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutput {
    #[serde(default)]
    columns: Option<Vec<String>>,
    #[serde(default)]
    optional: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawTiming {
    page_load_timeout_ms: u64,
    element_wait_timeout_ms: u64,
    request_delay_ms: u64,
    stable_timeout_ms: u64,
}

impl Default for RawTiming {
    fn default() -> Self {
        Self {
            page_load_timeout_ms: 10_000,
            element_wait_timeout_ms: 5_000,
            request_delay_ms: 1_000,
            stable_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawRetry {
    max_attempts: u32,
    base_delay_ms: u64,
    backoff_factor: f64,
    max_delay_ms: u64,
}

impl Default for RawRetry {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay_ms: INITIAL_BACKOFF_MS,
            backoff_factor: 2.0,
            max_delay_ms: MAX_BACKOFF_MS,
        }
    }
}

// ============================================================
// 検証済みプロファイル
// ============================================================

/// テスト用の上限
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub page_load_timeout: Duration,
    pub element_wait_timeout: Duration,
    pub request_delay: Duration,
    pub stable_timeout: Duration,
}

/// 絞り込みフィルター1つ分
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub name: String,
    /// `{option}` を含むコントロールのテンプレート
    pub control: Locator,
    pub options: Vec<String>,
    /// コントロールを表示させるために先にクリックする要素 (折りたたみパネル等)
    pub expand: Vec<Locator>,
    /// このフィルター専用の適用ボタン
    pub apply: Vec<Locator>,
}

impl FilterRule {
    pub fn control_for(&self, option: &str) -> Locator {
        self.control.fill("option", option)
    }
}

/// ページ総数をページ送り UI のテキストから読み取る規則
#[derive(Debug, Clone)]
pub struct TotalRule {
    pub selectors: Vec<Locator>,
    pub regex: Regex,
}

impl TotalRule {
    /// 例: "Page 1 of 12" → 12
    pub fn parse(&self, text: &str) -> Option<u32> {
        self.regex
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse().ok())
    }
}

#[derive(Debug, Clone)]
pub enum Pagination {
    /// 1ページのみ
    None,
    /// 「次へ」コントロール
    Next {
        selectors: Vec<Locator>,
        total: Option<TotalRule>,
    },
    /// 頭文字ごとの一覧 (`{letter}` を含むバケットコントロール)
    Alphabetical {
        bucket: Locator,
        letters: Vec<String>,
        all: Vec<Locator>,
    },
    /// `search_url` の `{page}` を進める
    PageIndex { start: u32 },
}

impl Pagination {
    pub fn mode(&self) -> &'static str {
        match self {
            Pagination::None => "single",
            Pagination::Next { .. } => "next",
            Pagination::Alphabetical { .. } => "alphabetical",
            Pagination::PageIndex { .. } => "page_index",
        }
    }
}

/// 詳細ページへのリンク
#[derive(Debug, Clone)]
pub struct LinkRule {
    pub selectors: Vec<Locator>,
    pub include: Option<Regex>,
    pub exclude: Vec<String>,
}

impl LinkRule {
    /// 絶対 URL が学校詳細ページへのリンクとして妥当か
    pub fn accepts(&self, url: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(url) {
                return false;
            }
        }
        let lower = url.to_ascii_lowercase();
        !self
            .exclude
            .iter()
            .any(|e| lower.contains(&e.to_ascii_lowercase()))
    }
}

/// 詳細リンクがない一覧から行ごとにレコードを作る規則
#[derive(Debug, Clone)]
pub struct ListingRowsRule {
    pub row: Locator,
    /// 行内のリンク。href を source_url にする
    pub link: Option<Locator>,
    /// 行の断片に対して評価するフィールド
    pub fields: Vec<FieldRule>,
}

/// 1フィールドの抽出規則
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub name: String,
    pub selectors: Vec<Locator>,
    pub required: bool,
    /// テキストではなく属性値を使う (`href` は絶対 URL に解決)
    pub attribute: Option<String>,
    pub pattern: Option<String>,
    /// 書き込み先のレコードキー (省略時はフィールド名)
    pub target: String,
    /// 取り除くラベル接頭辞 (例: "Address:")
    pub strip: Vec<String>,
}

/// 正規表現による分解規則。キャプチャ i 番 → `groups[i-1]`
#[derive(Debug, Clone)]
pub struct Pattern {
    pub regex: Regex,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SiteProfile {
    site: String,
    base_url: Url,
    search_url: Option<String>,
    page_ready: Vec<Locator>,
    dismiss: Vec<Locator>,
    filters: Vec<FilterRule>,
    apply_filters: Vec<Locator>,
    pagination: Pagination,
    links: LinkRule,
    listing_rows: Option<ListingRowsRule>,
    detail_ready: Vec<Locator>,
    fields: Vec<FieldRule>,
    patterns: BTreeMap<String, Pattern>,
    defaults: BTreeMap<String, String>,
    reject_names: Vec<String>,
    columns: Vec<String>,
    optional: Vec<String>,
    timing: Timing,
    retry: RetryPolicy,
    limits: Limits,
}

impl SiteProfile {
    /// YAML ファイルから読み込む
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScraperError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ScraperError::config(format!("プロファイルを読めません {}: {}", path.display(), e))
        })?;
        let profile = Self::from_yaml_str(&text)?;
        debug!("Loaded profile '{}' from {}", profile.site, path.display());
        Ok(profile)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ScraperError> {
        let raw: RawProfile = serde_yaml::from_str(yaml)?;
        Self::validate(raw)
    }

    fn validate(raw: RawProfile) -> Result<Self, ScraperError> {
        let base = raw
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScraperError::config("base_url がありません"))?;
        let base_url = Url::parse(base)
            .map_err(|e| ScraperError::config(format!("base_url '{}' が不正: {}", base, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ScraperError::config(format!(
                "base_url '{}' は http(s) ではありません",
                base
            )));
        }

        let site = match raw.site.map(|s| s.trim().to_string()) {
            Some(s) if !s.is_empty() => s,
            _ => base_url.host_str().unwrap_or("site").to_string(),
        };

        if let Some(template) = &raw.search_url {
            base_url
                .join(&template.replace("{page}", "1"))
                .map_err(|e| {
                    ScraperError::config(format!("search_url '{}' が不正: {}", template, e))
                })?;
        }

        check_locators("page_ready", &raw.page_ready)?;
        check_locators("dismiss", &raw.dismiss)?;
        check_locators("apply_filters", &raw.apply_filters)?;
        check_locators("detail.ready", &raw.detail.ready)?;

        let filters = ordered::<RawFilter>(raw.filters, "filters")?
            .into_iter()
            .map(|(name, f)| build_filter(name, f))
            .collect::<Result<Vec<_>, _>>()?;

        let pagination = build_pagination(raw.pagination, raw.search_url.as_deref())?;
        let links = build_links(raw.links)?;

        let mut patterns = BTreeMap::new();
        for (name, p) in raw.patterns {
            let regex = Regex::new(&p.regex).map_err(|e| {
                ScraperError::config(format!("パターン '{}' の正規表現が不正: {}", name, e))
            })?;
            if p.groups.is_empty() {
                return Err(ScraperError::config(format!(
                    "パターン '{}' に groups がありません",
                    name
                )));
            }
            if p.groups.len() > regex.captures_len() - 1 {
                return Err(ScraperError::config(format!(
                    "パターン '{}': groups ({}) がキャプチャ数 ({}) を超えています",
                    name,
                    p.groups.len(),
                    regex.captures_len() - 1
                )));
            }
            for g in &p.groups {
                require_record_key(g, &format!("パターン '{}' の groups", name))?;
            }
            patterns.insert(
                name,
                Pattern {
                    regex,
                    groups: p.groups,
                },
            );
        }

        let fields = ordered::<RawField>(raw.fields, "fields")?
            .into_iter()
            .map(|(name, f)| build_field("fields", name, f, &patterns))
            .collect::<Result<Vec<_>, _>>()?;
        let listing_rows = raw
            .listing_rows
            .map(|r| build_listing_rows(r, &patterns))
            .transpose()?;

        for key in raw.defaults.keys() {
            require_record_key(key, "defaults")?;
        }

        let columns = match raw.output.columns {
            Some(cols) if cols.is_empty() => {
                return Err(ScraperError::config("output.columns が空です"));
            }
            Some(cols) => cols,
            None => COLUMNS.iter().map(|c| c.to_string()).collect(),
        };
        for c in columns.iter().chain(raw.output.optional.iter()) {
            require_record_key(c, "output")?;
        }

        if raw.retry.max_attempts == 0 {
            return Err(ScraperError::config("retry.max_attempts は 1 以上が必要です"));
        }
        if !(raw.retry.backoff_factor >= 1.0) {
            return Err(ScraperError::config("retry.backoff_factor は 1 以上が必要です"));
        }

        let profile = SiteProfile {
            site,
            base_url,
            search_url: raw.search_url,
            page_ready: raw.page_ready,
            dismiss: raw.dismiss,
            filters,
            apply_filters: raw.apply_filters,
            pagination,
            links,
            listing_rows,
            detail_ready: raw.detail.ready,
            fields,
            patterns,
            defaults: raw.defaults,
            reject_names: raw.reject_names,
            columns,
            optional: raw.output.optional,
            timing: Timing {
                page_load_timeout: Duration::from_millis(raw.timing.page_load_timeout_ms),
                element_wait_timeout: Duration::from_millis(raw.timing.element_wait_timeout_ms),
                request_delay: Duration::from_millis(raw.timing.request_delay_ms),
                stable_timeout: Duration::from_millis(raw.timing.stable_timeout_ms),
            },
            retry: RetryPolicy::new(
                raw.retry.max_attempts,
                Duration::from_millis(raw.retry.base_delay_ms),
                raw.retry.backoff_factor,
            )
            .with_max_delay(Duration::from_millis(raw.retry.max_delay_ms)),
            limits: raw.limits,
        };

        profile.check_output_coverage()?;
        Ok(profile)
    }

    /// 出力列 (source_url 以外) がフィールド・パターン・既定値・optional のいずれかで賄われているか
    fn check_output_coverage(&self) -> Result<(), ScraperError> {
        if !self.fields.iter().any(|f| self.produces(f, "name")) {
            return Err(ScraperError::config("name を抽出するフィールドがありません"));
        }
        if let Some(rows) = &self.listing_rows {
            if !rows.fields.iter().any(|f| self.produces(f, "name")) {
                return Err(ScraperError::config(
                    "listing_rows: name を抽出するフィールドがありません",
                ));
            }
        }

        for column in &self.columns {
            if column == "source_url" {
                continue;
            }
            let produced = self.fields.iter().any(|f| self.produces(f, column))
                || self.defaults.contains_key(column)
                || self.optional.contains(column);
            if !produced {
                return Err(ScraperError::config(format!(
                    "出力列 '{}' を埋めるフィールド・既定値がなく、optional にもありません",
                    column
                )));
            }
        }
        Ok(())
    }

    fn produces(&self, field: &FieldRule, key: &str) -> bool {
        match field.pattern.as_deref().and_then(|p| self.patterns.get(p)) {
            Some(pattern) => pattern.groups.iter().any(|g| g == key),
            None => field.target == key,
        }
    }

    /// 実行パラメータによる上書き
    pub fn with_overrides(mut self, options: &RunOptions) -> Self {
        if let Some(max_pages) = options.max_pages {
            self.limits.max_pages = Some(max_pages);
        }
        if let Some(max_items) = options.max_items {
            self.limits.max_items = Some(max_items);
        }
        if let Some(t) = options.page_load_timeout {
            self.timing.page_load_timeout = t;
        }
        if let Some(t) = options.element_wait_timeout {
            self.timing.element_wait_timeout = t;
        }
        if let Some(d) = options.request_delay {
            self.timing.request_delay = d;
        }
        if let Some(n) = options.max_attempts {
            self.retry.max_attempts = n.max(1);
        }
        self
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// 検索ページの URL (`{page}` はページ番号で置換)
    pub fn search_url(&self, page: u32) -> String {
        match &self.search_url {
            Some(template) => {
                let filled = template.replace("{page}", &page.to_string());
                self.base_url
                    .join(&filled)
                    .map(|u| u.to_string())
                    .unwrap_or(filled)
            }
            None => self.base_url.to_string(),
        }
    }

    pub fn page_ready(&self) -> &[Locator] {
        &self.page_ready
    }

    pub fn dismiss(&self) -> &[Locator] {
        &self.dismiss
    }

    pub fn filters(&self) -> &[FilterRule] {
        &self.filters
    }

    pub fn apply_filters(&self) -> &[Locator] {
        &self.apply_filters
    }

    pub fn pagination(&self) -> &Pagination {
        &self.pagination
    }

    pub fn links(&self) -> &LinkRule {
        &self.links
    }

    pub fn listing_rows(&self) -> Option<&ListingRowsRule> {
        self.listing_rows.as_ref()
    }

    pub fn detail_ready(&self) -> &[Locator] {
        &self.detail_ready
    }

    pub fn fields(&self) -> &[FieldRule] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// フィールドのセレクタ候補 (宣言順)
    pub fn candidates(&self, field: &str) -> &[Locator] {
        self.field(field).map(|f| f.selectors.as_slice()).unwrap_or(&[])
    }

    pub fn pattern(&self, name: &str) -> Option<&Pattern> {
        self.patterns.get(name)
    }

    pub fn default_for(&self, key: &str) -> Option<&str> {
        self.defaults.get(key).map(String::as_str)
    }

    /// 学校名として不適切な文字列を含むか (大文字小文字は区別しない)
    pub fn rejects_name(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.reject_names
            .iter()
            .any(|r| lower.contains(&r.to_lowercase()))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn page_load_timeout(&self) -> Duration {
        self.timing.page_load_timeout
    }

    pub fn element_wait_timeout(&self) -> Duration {
        self.timing.element_wait_timeout
    }

    pub fn request_delay(&self) -> Duration {
        self.timing.request_delay
    }

    pub fn stable_timeout(&self) -> Duration {
        self.timing.stable_timeout
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }
}

/// YAML マッピングを宣言順のまま読み出す
fn ordered<T: DeserializeOwned>(
    mapping: Mapping,
    section: &str,
) -> Result<Vec<(String, T)>, ScraperError> {
    let mut out = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = match key {
            Value::String(s) => s,
            other => {
                return Err(ScraperError::config(format!(
                    "{} のキーが文字列ではありません: {:?}",
                    section, other
                )))
            }
        };
        let parsed = serde_yaml::from_value(value).map_err(|e| {
            ScraperError::config(format!("{}.{} が不正: {}", section, name, e))
        })?;
        out.push((name, parsed));
    }
    Ok(out)
}

fn check_locators(section: &str, locators: &[Locator]) -> Result<(), ScraperError> {
    for locator in locators {
        locator
            .validate()
            .map_err(|e| ScraperError::config(format!("{}: {}", section, e)))?;
    }
    Ok(())
}

fn require_record_key(key: &str, section: &str) -> Result<(), ScraperError> {
    if is_record_key(key) {
        Ok(())
    } else {
        Err(ScraperError::config(format!(
            "{}: '{}' はレコードの列ではありません",
            section, key
        )))
    }
}

/// テンプレートの検証は代表値で埋めてから行う
fn check_template(section: &str, locator: &Locator, key: &str) -> Result<(), ScraperError> {
    if !locator.has_placeholder(key) {
        return Err(ScraperError::config(format!(
            "{}: {} に {{{}}} がありません",
            section, locator, key
        )));
    }
    check_locators(section, &[locator.fill(key, "A")])
}

fn build_filter(name: String, raw: RawFilter) -> Result<FilterRule, ScraperError> {
    let section = format!("filters.{}", name);
    let options: Vec<String> = raw
        .options
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    if options.is_empty() {
        return Err(ScraperError::config(format!("{}: options がありません", section)));
    }
    check_template(&section, &raw.control, "option")?;
    check_locators(&section, &raw.expand)?;
    check_locators(&section, &raw.apply)?;

    Ok(FilterRule {
        name,
        control: raw.control,
        options,
        expand: raw.expand,
        apply: raw.apply,
    })
}

fn build_pagination(
    raw: Option<RawPagination>,
    search_url: Option<&str>,
) -> Result<Pagination, ScraperError> {
    let raw = raw.unwrap_or_default();
    let declared = [
        raw.next.is_some(),
        raw.alphabetical.is_some(),
        raw.page_index.is_some(),
    ]
    .iter()
    .filter(|d| **d)
    .count();
    if declared > 1 {
        return Err(ScraperError::config(
            "pagination は next / alphabetical / page_index のいずれか1つだけ指定してください",
        ));
    }

    if let Some(next) = raw.next {
        if next.selectors.is_empty() {
            return Err(ScraperError::config("pagination.next.selectors が空です"));
        }
        check_locators("pagination.next", &next.selectors)?;
        let total = match next.total {
            Some(t) => {
                check_locators("pagination.next.total", &t.selectors)?;
                let regex = Regex::new(&t.regex).map_err(|e| {
                    ScraperError::config(format!("pagination.next.total の正規表現が不正: {}", e))
                })?;
                if regex.captures_len() < 2 {
                    return Err(ScraperError::config(
                        "pagination.next.total の正規表現にキャプチャがありません",
                    ));
                }
                Some(TotalRule {
                    selectors: t.selectors,
                    regex,
                })
            }
            None => None,
        };
        return Ok(Pagination::Next {
            selectors: next.selectors,
            total,
        });
    }

    if let Some(alpha) = raw.alphabetical {
        check_template("pagination.alphabetical", &alpha.bucket, "letter")?;
        check_locators("pagination.alphabetical.all", &alpha.all)?;
        let letters = alpha
            .letters
            .unwrap_or_else(|| ('A'..='Z').map(String::from).collect());
        if letters.is_empty() {
            return Err(ScraperError::config("pagination.alphabetical.letters が空です"));
        }
        return Ok(Pagination::Alphabetical {
            bucket: alpha.bucket,
            letters,
            all: alpha.all,
        });
    }

    if let Some(index) = raw.page_index {
        if !search_url.map(|s| s.contains("{page}")).unwrap_or(false) {
            return Err(ScraperError::config(
                "pagination.page_index には {page} を含む search_url が必要です",
            ));
        }
        return Ok(Pagination::PageIndex {
            start: index.start.unwrap_or(1),
        });
    }

    Ok(Pagination::None)
}

fn build_links(raw: Option<RawLinks>) -> Result<LinkRule, ScraperError> {
    let raw = raw.ok_or_else(|| ScraperError::config("links がありません"))?;
    if raw.selectors.is_empty() {
        return Err(ScraperError::config("links.selectors が空です"));
    }
    check_locators("links", &raw.selectors)?;
    let include = raw
        .include
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| ScraperError::config(format!("links.include の正規表現が不正: {}", e)))?;

    Ok(LinkRule {
        selectors: raw.selectors,
        include,
        exclude: raw.exclude,
    })
}

fn build_listing_rows(
    raw: RawListingRows,
    patterns: &BTreeMap<String, Pattern>,
) -> Result<ListingRowsRule, ScraperError> {
    check_locators("listing_rows.row", slice::from_ref(&raw.row))?;
    if let Some(link) = &raw.link {
        check_locators("listing_rows.link", slice::from_ref(link))?;
    }
    let fields = ordered::<RawField>(raw.fields, "listing_rows.fields")?
        .into_iter()
        .map(|(name, f)| build_field("listing_rows.fields", name, f, patterns))
        .collect::<Result<Vec<_>, _>>()?;
    if fields.is_empty() {
        return Err(ScraperError::config("listing_rows.fields が空です"));
    }

    Ok(ListingRowsRule {
        row: raw.row,
        link: raw.link,
        fields,
    })
}

fn build_field(
    prefix: &str,
    name: String,
    raw: RawField,
    patterns: &BTreeMap<String, Pattern>,
) -> Result<FieldRule, ScraperError> {
    let section = format!("{}.{}", prefix, name);
    if raw.selectors.is_empty() {
        return Err(ScraperError::config(format!("{}: selectors がありません", section)));
    }
    check_locators(&section, &raw.selectors)?;

    if let Some(p) = &raw.pattern {
        if !patterns.contains_key(p) {
            return Err(ScraperError::config(format!(
                "{}: 未定義のパターン '{}'",
                section, p
            )));
        }
    }

    let target = raw.target.unwrap_or_else(|| name.clone());
    if raw.pattern.is_none() {
        require_record_key(&target, &section)?;
    }

    Ok(FieldRule {
        name,
        selectors: raw.selectors,
        required: raw.required,
        attribute: raw.attribute.filter(|a| !a.trim().is_empty()),
        pattern: raw.pattern,
        target,
        strip: raw.strip,
    })
}
