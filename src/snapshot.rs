//! レンダリング済みページのスナップショット
//!
//! `PageSnapshot` は URL と outerHTML を保持するだけの `Send` な値。
//! 要素の選択は `document()` で得た `Document` 上で同期的に行う
//! (`scraper::Html` は `Send` ではないため await をまたいで保持しない)。

use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::locator::{collapse, Locator, Selection, TextMatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    url: String,
    html: String,
}

impl PageSnapshot {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn document(&self) -> Document {
        Document {
            html: Html::parse_document(&self.html),
            base: Url::parse(&self.url).ok(),
        }
    }
}

/// 解析済み DOM
pub struct Document {
    html: Html,
    base: Option<Url>,
}

impl Document {
    /// ロケーターに一致する要素 (ドキュメント順)
    pub fn select(&self, locator: &Locator) -> Vec<ElementRef<'_>> {
        let selection = match locator.selection() {
            Ok(s) => s,
            Err(e) => {
                debug!("Skipping invalid locator {}: {}", locator, e);
                return Vec::new();
            }
        };

        match selection {
            Selection::Path(expr) => expr.select(&self.html),
            Selection::Css { css, text } => {
                let selector = match Selector::parse(&css) {
                    Ok(s) => s,
                    Err(_) => return Vec::new(),
                };
                let found: Vec<ElementRef<'_>> = self.html.select(&selector).collect();
                match text {
                    Some(m) => innermost_matching(found, &m),
                    None => found,
                }
            }
        }
    }

    pub fn exists(&self, locator: &Locator) -> bool {
        !self.select(locator).is_empty()
    }

    /// 一致した要素の正規化テキスト (空文字は除く)
    pub fn texts(&self, locator: &Locator) -> Vec<String> {
        self.select(locator)
            .into_iter()
            .map(|el| element_text(&el))
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// 一致した要素の属性値 (空文字は除く)
    pub fn attrs(&self, locator: &Locator, name: &str) -> Vec<String> {
        self.select(locator)
            .into_iter()
            .filter_map(|el| el.value().attr(name).map(|v| v.trim().to_string()))
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// 一致した要素それぞれの outerHTML
    ///
    /// 単独で解析し直せるよう、表の行・セルは `<table>` で包む。
    pub fn fragments(&self, locator: &Locator) -> Vec<String> {
        self.select(locator)
            .into_iter()
            .map(|el| {
                let html = el.html();
                match el.value().name() {
                    "tr" | "thead" | "tbody" | "tfoot" => format!("<table>{}</table>", html),
                    "td" | "th" => format!("<table><tr>{}</tr></table>", html),
                    _ => html,
                }
            })
            .collect()
    }

    /// 相対 URL をページ URL 基準の絶対 URL にする
    pub fn absolute_url(&self, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() {
            return None;
        }
        let joined = match &self.base {
            Some(base) => base.join(href).ok()?,
            None => Url::parse(href).ok()?,
        };
        match joined.scheme() {
            "http" | "https" => Some(joined.to_string()),
            _ => None,
        }
    }
}

/// 要素の表示テキスト (空白は1つに畳む)
pub fn element_text(el: &ElementRef<'_>) -> String {
    collapse(&el.text().collect::<Vec<_>>().join(" "))
}

/// 無効化されたコントロールか (disabled 属性 / aria-disabled / class)
pub fn is_disabled(el: &ElementRef<'_>) -> bool {
    let v = el.value();
    v.attr("disabled").is_some()
        || v.attr("aria-disabled")
            .map(|a| a.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        || v.classes().any(|c| c.to_ascii_lowercase().contains("disabled"))
}

fn innermost_matching<'a>(found: Vec<ElementRef<'a>>, m: &TextMatch) -> Vec<ElementRef<'a>> {
    let hits: Vec<ElementRef<'a>> = found
        .into_iter()
        .filter(|el| m.matches(&element_text(el)))
        .collect();

    hits.iter()
        .filter(|el| {
            !hits.iter().any(|other| {
                other.id() != el.id() && other.ancestors().any(|a| a.id() == el.id())
            })
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> PageSnapshot {
        PageSnapshot::new(
            "https://txschools.gov/?view=schools&lng=en",
            r#"<html><body>
                <nav><ul><li><a class="page" href="?page=2">Next</a></li></ul></nav>
                <div class="results">
                  <a class="school" href="/schools/101912001/overview"> Austin   High </a>
                  <a class="school" href="https://txschools.gov/schools/101912002/overview">Bellaire</a>
                  <a class="school" href="mailto:info@example.org">Mail</a>
                </div>
                <button class="v-btn v-btn--disabled">Prev</button>
                <button aria-disabled="true">Also prev</button>
                <button>Go</button>
            </body></html>"#,
        )
    }

    #[test]
    fn test_css_texts_are_normalized() {
        let doc = snapshot().document();
        let texts = doc.texts(&Locator::parse("a.school"));
        assert_eq!(texts, vec!["Austin High", "Bellaire", "Mail"]);
    }

    #[test]
    fn test_text_locator_picks_innermost() {
        let doc = snapshot().document();
        let found = doc.select(&Locator::parse("text=Next"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value().name(), "a");
    }

    #[test]
    fn test_absolute_url_resolution() {
        let doc = snapshot().document();
        let hrefs = doc.attrs(&Locator::parse("a.school"), "href");
        let urls: Vec<String> = hrefs.iter().filter_map(|h| doc.absolute_url(h)).collect();
        assert_eq!(
            urls,
            vec![
                "https://txschools.gov/schools/101912001/overview",
                "https://txschools.gov/schools/101912002/overview",
            ]
        );
    }

    #[test]
    fn test_row_fragments_parse_on_their_own() {
        let snap = PageSnapshot::new(
            "https://txschools.gov/search",
            r#"<table><tbody>
                 <tr><td><a href="/schools/1">Alamo El</a></td><td>Austin ISD</td></tr>
                 <tr><td>Bowie High</td><td>Dallas ISD</td></tr>
               </tbody></table>"#,
        );
        let rows = snap.document().fragments(&Locator::parse("tbody tr"));
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("<table><tr>"));

        let row = PageSnapshot::new(snap.url(), rows[1].as_str()).document();
        assert_eq!(row.texts(&Locator::parse("td:nth-child(2)")), vec!["Dallas ISD"]);
        let first = PageSnapshot::new(snap.url(), rows[0].as_str()).document();
        let href = first.attrs(&Locator::parse("a"), "href");
        assert_eq!(
            first.absolute_url(&href[0]).as_deref(),
            Some("https://txschools.gov/schools/1")
        );
    }

    #[test]
    fn test_disabled_detection() {
        let doc = snapshot().document();
        let buttons = doc.select(&Locator::parse("button"));
        assert_eq!(buttons.len(), 3);
        assert!(is_disabled(&buttons[0]));
        assert!(is_disabled(&buttons[1]));
        assert!(!is_disabled(&buttons[2]));
    }

    #[test]
    fn test_path_locator() {
        let doc = snapshot().document();
        assert_eq!(
            doc.texts(&Locator::parse("//div[@class='results']/a[2]")),
            vec!["Bellaire"]
        );
    }
}
