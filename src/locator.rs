//! セレクタ候補 (ロケーター)
//!
//! YAML 上では短縮文字列 (`"//h1"` → パス, `"text=Next"` → テキスト一致,
//! それ以外は CSS) かマップ形式で書ける。

use std::fmt;

use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::error::ScraperError;
use crate::xpath::PathExpr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "LocatorDef")]
pub enum Locator {
    Css(String),
    Class(String),
    Attribute {
        name: String,
        value: Option<String>,
        tag: Option<String>,
    },
    Text {
        text: String,
        tag: Option<String>,
        exact: bool,
    },
    Path(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocatorDef {
    Shorthand(String),
    Css {
        css: String,
    },
    Class {
        class: String,
    },
    Attribute {
        attribute: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        tag: Option<String>,
    },
    Text {
        text: String,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        exact: bool,
    },
    Path {
        path: String,
    },
}

impl From<LocatorDef> for Locator {
    fn from(def: LocatorDef) -> Self {
        match def {
            LocatorDef::Shorthand(s) => Locator::parse(&s),
            LocatorDef::Css { css } => Locator::Css(css),
            LocatorDef::Class { class } => Locator::Class(class),
            LocatorDef::Attribute {
                attribute,
                value,
                tag,
            } => Locator::Attribute {
                name: attribute,
                value,
                tag,
            },
            LocatorDef::Text { text, tag, exact } => Locator::Text { text, tag, exact },
            LocatorDef::Path { path } => Locator::Path(path),
        }
    }
}

/// テキスト一致条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextMatch {
    pub needle: String,
    pub exact: bool,
}

impl TextMatch {
    pub fn matches(&self, normalized: &str) -> bool {
        if self.exact {
            normalized == self.needle
        } else {
            normalized.contains(&self.needle)
        }
    }
}

/// ロケーターの評価方法
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// CSS で選択し、必要ならテキストで絞り込む (最も内側の要素のみ)
    Css { css: String, text: Option<TextMatch> },
    Path(PathExpr),
}

impl Locator {
    /// 短縮記法を解釈する
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.starts_with('/') || trimmed.starts_with('(') || trimmed.starts_with("./") {
            Locator::Path(trimmed.to_string())
        } else if let Some(text) = trimmed.strip_prefix("text=") {
            Locator::Text {
                text: text.trim().to_string(),
                tag: None,
                exact: false,
            }
        } else {
            Locator::Css(trimmed.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Locator::Css(_) => "css",
            Locator::Class(_) => "class",
            Locator::Attribute { .. } => "attribute",
            Locator::Text { .. } => "text",
            Locator::Path(_) => "path",
        }
    }

    /// CSS ベースのロケーターが使うセレクタ文字列
    pub fn css(&self) -> Option<String> {
        match self {
            Locator::Css(css) => Some(css.clone()),
            Locator::Class(class) => Some(
                class
                    .split_whitespace()
                    .map(|c| format!(".{}", c))
                    .collect::<String>(),
            ),
            Locator::Attribute { name, value, tag } => {
                let tag = tag.as_deref().unwrap_or("");
                Some(match value {
                    Some(v) => format!("{}[{}=\"{}\"]", tag, name, escape_css_string(v)),
                    None => format!("{}[{}]", tag, name),
                })
            }
            Locator::Text { tag, .. } => Some(tag.clone().unwrap_or_else(|| "*".to_string())),
            Locator::Path(_) => None,
        }
    }

    /// 構文を検証し、評価方法に変換する
    pub fn selection(&self) -> Result<Selection, ScraperError> {
        if let Locator::Path(path) = self {
            return Ok(Selection::Path(PathExpr::parse(path)?));
        }

        let css = self.css().unwrap_or_default();
        if css.trim().is_empty() {
            return Err(ScraperError::config(format!("空のセレクタ: {}", self)));
        }
        Selector::parse(&css)
            .map_err(|e| ScraperError::config(format!("CSSセレクタ '{}' が不正: {:?}", css, e)))?;

        let text = match self {
            Locator::Text { text, exact, .. } => Some(TextMatch {
                needle: collapse(text),
                exact: *exact,
            }),
            _ => None,
        };

        Ok(Selection::Css { css, text })
    }

    pub fn validate(&self) -> Result<(), ScraperError> {
        self.selection().map(|_| ())
    }

    /// `{key}` を含むか
    pub fn has_placeholder(&self, key: &str) -> bool {
        let token = format!("{{{}}}", key);
        self.strings().iter().any(|s| s.contains(&token))
    }

    /// `{key}` を値で置き換えたロケーターを返す
    pub fn fill(&self, key: &str, value: &str) -> Locator {
        let token = format!("{{{}}}", key);
        let sub = |s: &String| s.replace(&token, value);
        match self {
            Locator::Css(s) => Locator::Css(sub(s)),
            Locator::Class(s) => Locator::Class(sub(s)),
            Locator::Attribute { name, value, tag } => Locator::Attribute {
                name: sub(name),
                value: value.as_ref().map(sub),
                tag: tag.as_ref().map(sub),
            },
            Locator::Text { text, tag, exact } => Locator::Text {
                text: sub(text),
                tag: tag.as_ref().map(sub),
                exact: *exact,
            },
            Locator::Path(s) => Locator::Path(sub(s)),
        }
    }

    fn strings(&self) -> Vec<&String> {
        match self {
            Locator::Css(s) | Locator::Class(s) | Locator::Path(s) => vec![s],
            Locator::Attribute { name, value, tag } => {
                let mut v = vec![name];
                v.extend(value.iter());
                v.extend(tag.iter());
                v
            }
            Locator::Text { text, tag, .. } => {
                let mut v = vec![text];
                v.extend(tag.iter());
                v
            }
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css:{}", s),
            Locator::Class(s) => write!(f, "class:{}", s),
            Locator::Attribute { name, value, tag } => write!(
                f,
                "attr:{}[{}{}]",
                tag.as_deref().unwrap_or(""),
                name,
                value.as_ref().map(|v| format!("={}", v)).unwrap_or_default()
            ),
            Locator::Text { text, tag, exact } => write!(
                f,
                "text{}:{}'{}'",
                if *exact { "=" } else { "~" },
                tag.as_deref().unwrap_or("*"),
                text
            ),
            Locator::Path(s) => write!(f, "path:{}", s),
        }
    }
}

fn escape_css_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

pub(crate) fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorthand_detection() {
        assert_eq!(Locator::parse("//h1"), Locator::Path("//h1".into()));
        assert_eq!(Locator::parse("(//a)[1]"), Locator::Path("(//a)[1]".into()));
        assert_eq!(Locator::parse("h1.title"), Locator::Css("h1.title".into()));
        assert_eq!(
            Locator::parse("text=Next"),
            Locator::Text {
                text: "Next".into(),
                tag: None,
                exact: false
            }
        );
    }

    #[test]
    fn test_yaml_forms() {
        let yaml = r#"
- "a.no-underline"
- css: "div.address"
- class: "school-name primary"
- attribute: aria-label
  value: Next page
  tag: button
- text: Website
  tag: a
- path: "//h1"
"#;
        let locators: Vec<Locator> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(locators.len(), 6);
        assert_eq!(locators[0], Locator::Css("a.no-underline".into()));
        assert_eq!(locators[2].css().unwrap(), ".school-name.primary");
        assert_eq!(
            locators[3].css().unwrap(),
            "button[aria-label=\"Next page\"]"
        );
        assert_eq!(locators[4].kind(), "text");
        assert_eq!(locators[5], Locator::Path("//h1".into()));
    }

    #[test]
    fn test_validation() {
        assert!(Locator::Css("div.ok > span".into()).validate().is_ok());
        assert!(Locator::Css("div[".into()).validate().is_err());
        assert!(Locator::Path("//div[".into()).validate().is_err());
        assert!(Locator::Css("  ".into()).validate().is_err());
    }

    #[test]
    fn test_fill_placeholder() {
        let loc = Locator::parse("button[value='{letter}']");
        assert!(loc.has_placeholder("letter"));
        assert!(!loc.has_placeholder("option"));
        assert_eq!(loc.fill("letter", "B"), Locator::Css("button[value='B']".into()));

        let text = Locator::Text {
            text: "{option}".into(),
            tag: Some("label".into()),
            exact: true,
        };
        assert_eq!(
            text.fill("option", "Elementary"),
            Locator::Text {
                text: "Elementary".into(),
                tag: Some("label".into()),
                exact: true
            }
        );
    }
}
