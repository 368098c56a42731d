//! 抽出ルールエンジン
//!
//! プロファイルのフィールド定義をページスナップショットに適用し、
//! 未正規化のフィールド値 (`PartialRecord`) を得る。ブラウザには触れない。

use tracing::debug;

use crate::profile::{FieldRule, ListingRowsRule, Pattern, SiteProfile};
use crate::record::PartialRecord;
use crate::snapshot::{Document, PageSnapshot};

/// 必須フィールドが解決できなかったことの通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMissing {
    pub field: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub record: PartialRecord,
    pub missing: Vec<FieldMissing>,
}

impl Extraction {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// 全フィールドを抽出する
///
/// 候補は宣言順に試し、空でない値を返した最初の候補を採用する。
/// 一致しなかったフィールドも空文字としてキーは必ず残す。
pub fn extract(snapshot: &PageSnapshot, profile: &SiteProfile) -> Extraction {
    extract_fields(snapshot, profile.fields(), profile)
}

/// 任意のフィールド群を抽出する (パターンはプロファイルから引く)
pub fn extract_fields(
    snapshot: &PageSnapshot,
    fields: &[FieldRule],
    profile: &SiteProfile,
) -> Extraction {
    let doc = snapshot.document();
    let mut extraction = Extraction::default();

    for field in fields {
        let value = resolve_field(&doc, field);
        if value.is_none() && field.required {
            debug!("Required field '{}' not found on {}", field.name, snapshot.url());
            extraction.missing.push(FieldMissing {
                field: field.name.clone(),
                url: snapshot.url().to_string(),
            });
        }

        let text = value.unwrap_or_default();
        let pattern = field.pattern.as_deref().and_then(|p| profile.pattern(p));
        match pattern {
            Some(pattern) => {
                for (key, part) in decompose(pattern, &text) {
                    extraction.record.set(&key, part);
                }
            }
            None => extraction.record.set(&field.target, text),
        }
    }

    extraction
}

/// 一覧表の1行から得た値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    /// 行内リンクの絶対 URL。リンクがなければ一覧ページの URL
    pub source_url: String,
    pub extraction: Extraction,
}

impl ListingRow {
    /// ページをまたいだ重複判定用のキー
    pub fn key(&self) -> String {
        let mut key = self.source_url.clone();
        for k in self.extraction.record.keys() {
            key.push('\u{1f}');
            key.push_str(self.extraction.record.get(k).unwrap_or(""));
        }
        key
    }
}

/// 一覧ページの各行を断片として切り出し、行ごとにフィールドを抽出する
///
/// 中身のない行 (見出し行など) は捨てる。
pub fn extract_rows(
    snapshot: &PageSnapshot,
    rule: &ListingRowsRule,
    profile: &SiteProfile,
) -> Vec<ListingRow> {
    let fragments = snapshot.document().fragments(&rule.row);
    let rows: Vec<ListingRow> = fragments
        .into_iter()
        .filter_map(|html| {
            let row = PageSnapshot::new(snapshot.url(), html);
            let link = rule.link.as_ref().and_then(|link| {
                let doc = row.document();
                doc.attrs(link, "href")
                    .iter()
                    .find_map(|href| doc.absolute_url(href))
            });
            let extraction = extract_fields(&row, &rule.fields, profile);
            if extraction.record.keys().all(|k| extraction.record.get(k) == Some("")) {
                return None;
            }
            Some(ListingRow {
                source_url: link.unwrap_or_else(|| snapshot.url().to_string()),
                extraction,
            })
        })
        .collect();
    debug!("{} listing rows on {}", rows.len(), snapshot.url());
    rows
}

/// 1フィールド分の候補を順に評価する
pub fn resolve_field(doc: &Document, field: &FieldRule) -> Option<String> {
    for (index, locator) in field.selectors.iter().enumerate() {
        let raw = match &field.attribute {
            Some(attr) => doc
                .attrs(locator, attr)
                .into_iter()
                .next()
                .map(|v| resolve_attribute(doc, attr, v)),
            None => doc.texts(locator).into_iter().next(),
        };

        if let Some(raw) = raw {
            let value = strip_labels(&raw, &field.strip);
            if !value.is_empty() {
                debug!(
                    "Field '{}' matched candidate #{} ({})",
                    field.name,
                    index + 1,
                    locator
                );
                return Some(value);
            }
        }
    }
    None
}

fn resolve_attribute(doc: &Document, attr: &str, value: String) -> String {
    if attr.eq_ignore_ascii_case("href") || attr.eq_ignore_ascii_case("src") {
        doc.absolute_url(&value).unwrap_or(value)
    } else {
        value
    }
}

/// 先頭のラベル (大文字小文字は区別しない) を取り除く
pub fn strip_labels(text: &str, labels: &[String]) -> String {
    let mut rest = text.trim();
    for label in labels {
        let label = label.trim();
        if label.is_empty() || rest.len() < label.len() {
            continue;
        }
        if let Some(head) = rest.get(..label.len()) {
            if head.eq_ignore_ascii_case(label) {
                rest = rest[label.len()..].trim_start();
            }
        }
    }
    rest.trim().to_string()
}

/// 正規表現で分解する。一致しなかったグループは空文字、
/// 全体が一致しなければ元の文字列を先頭グループに入れる
pub fn decompose(pattern: &Pattern, text: &str) -> Vec<(String, String)> {
    let text = text.trim();
    match pattern.regex.captures(text) {
        Some(caps) => pattern
            .groups
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let part = caps
                    .get(i + 1)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                (key.clone(), part)
            })
            .collect(),
        None => pattern
            .groups
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let part = if i == 0 { text.to_string() } else { String::new() };
                (key.clone(), part)
            })
            .collect(),
    }
}
