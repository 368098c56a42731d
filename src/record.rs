//! 学校レコードと組み立て処理

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::profile::SiteProfile;

/// 出力スキーマのキー (CSV の既定列順)
pub const COLUMNS: [&str; 11] = [
    "name",
    "address1",
    "address2",
    "city",
    "state",
    "zip",
    "phone",
    "website",
    "grades_served",
    "district",
    "source_url",
];

pub fn is_record_key(key: &str) -> bool {
    COLUMNS.contains(&key)
}

/// 学校レコード
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchoolRecord {
    pub name: String,
    pub address1: String,
    pub address2: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub phone: String,
    pub website: String,
    pub grades_served: String,
    pub district: String,
    pub source_url: String,
}

impl SchoolRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        let v = match key {
            "name" => &self.name,
            "address1" => &self.address1,
            "address2" => &self.address2,
            "city" => &self.city,
            "state" => &self.state,
            "zip" => &self.zip,
            "phone" => &self.phone,
            "website" => &self.website,
            "grades_served" => &self.grades_served,
            "district" => &self.district,
            "source_url" => &self.source_url,
            _ => return None,
        };
        Some(v.as_str())
    }

    fn slot(&mut self, key: &str) -> Option<&mut String> {
        Some(match key {
            "name" => &mut self.name,
            "address1" => &mut self.address1,
            "address2" => &mut self.address2,
            "city" => &mut self.city,
            "state" => &mut self.state,
            "zip" => &mut self.zip,
            "phone" => &mut self.phone,
            "website" => &mut self.website,
            "grades_served" => &mut self.grades_served,
            "district" => &mut self.district,
            "source_url" => &mut self.source_url,
            _ => return None,
        })
    }
}

/// 抽出直後の未正規化フィールド
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialRecord {
    values: BTreeMap<String, String>,
}

impl PartialRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// 既に値がある場合、空文字では上書きしない
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() && self.values.contains_key(key) {
            return;
        }
        self.values.insert(key.to_string(), value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// レコードを出力しない理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingName,
    MissingSourceUrl,
    RejectedName(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingName => f.write_str("name is empty"),
            Rejection::MissingSourceUrl => f.write_str("source_url is empty"),
            Rejection::RejectedName(name) => write!(f, "name '{}' is not a school", name),
        }
    }
}

/// 抽出結果とプロファイル既定値から最終レコードを組み立てる (純関数)
pub fn assemble(
    partial: &PartialRecord,
    profile: &SiteProfile,
    source_url: &str,
) -> Result<SchoolRecord, Rejection> {
    let mut record = SchoolRecord::default();

    for key in COLUMNS {
        let raw = partial.get(key).unwrap_or("");
        let mut value = collapse_whitespace(raw);
        if value.is_empty() {
            if let Some(default) = profile.default_for(key) {
                value = collapse_whitespace(default);
            }
        }
        if let Some(slot) = record.slot(key) {
            *slot = value;
        }
    }

    record.source_url = source_url.trim().to_string();
    record.phone = normalize_phone(&record.phone);
    record.website = normalize_website(&record.website);
    record.state = record.state.to_ascii_uppercase();

    if record.name.is_empty() {
        return Err(Rejection::MissingName);
    }
    if record.source_url.is_empty() {
        return Err(Rejection::MissingSourceUrl);
    }
    if profile.rejects_name(&record.name) {
        return Err(Rejection::RejectedName(record.name));
    }

    Ok(record)
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 10桁 (先頭 1 付き 11 桁も可) を `(AAA) EEE-LLLL` にそろえる。
/// それ以外は前後空白を除いた元の文字列
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = match digits.len() {
        11 if digits.starts_with('1') => &digits[1..],
        _ => digits.as_str(),
    };

    if digits.len() == 10 {
        format!("({}) {}-{}", &digits[0..3], &digits[3..6], &digits[6..10])
    } else {
        raw.trim().to_string()
    }
}

/// スキーム補完・末尾スラッシュ除去済みの絶対 URL。解釈できなければ空文字
pub fn normalize_website(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }

    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let parsed = match Url::parse(&with_scheme) {
        Ok(u) if u.host_str().is_some() => u,
        _ => return String::new(),
    };

    let mut out = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or_default()
    );
    if let Some(port) = parsed.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(parsed.path().trim_end_matches('/'));
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
site: test
base_url: https://example.test/schools
links:
  selectors: ["a.school"]
fields:
  name:
    selectors: ["h1"]
    required: true
  address:
    selectors: [".address"]
    pattern: address
  phone:
    selectors: [".phone"]
patterns:
  address:
    regex: '^(.+?),\s*([^,]+),\s*([A-Za-z]{2})\s+(\d{5})$'
    groups: [address1, city, state, zip]
defaults:
  state: tx
reject_names: ["Report Card"]
output:
  optional: [address2, website, grades_served, district]
"#;

    fn profile() -> SiteProfile {
        SiteProfile::from_yaml_str(PROFILE).unwrap()
    }

    #[test]
    fn test_phone_formats_normalize_to_same_grouping() {
        assert_eq!(normalize_phone("(512) 555-0100"), "(512) 555-0100");
        assert_eq!(normalize_phone("512.555.0100"), "(512) 555-0100");
        assert_eq!(normalize_phone("1-512-555-0100"), "(512) 555-0100");
        assert_eq!(normalize_phone(" ext. 12 "), "ext. 12");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn test_website_normalization() {
        assert_eq!(normalize_website("www.austinisd.org/"), "https://www.austinisd.org");
        assert_eq!(
            normalize_website("http://example.org/school/?id=4"),
            "http://example.org/school?id=4"
        );
        assert_eq!(normalize_website("   "), "");
        assert_eq!(normalize_website("http://"), "");
    }

    #[test]
    fn test_assemble_applies_defaults_and_trims() {
        let mut partial = PartialRecord::new();
        partial.set("name", "  Austin   High School ");
        partial.set("phone", "512.555.0100");
        partial.set("state", "");

        let record = assemble(&partial, &profile(), "https://example.test/schools/1").unwrap();
        assert_eq!(record.name, "Austin High School");
        assert_eq!(record.phone, "(512) 555-0100");
        assert_eq!(record.state, "TX");
        assert_eq!(record.city, "");
        assert_eq!(record.source_url, "https://example.test/schools/1");
    }

    #[test]
    fn test_assemble_requires_name_and_source() {
        let partial = PartialRecord::new();
        assert_eq!(
            assemble(&partial, &profile(), "https://example.test/schools/1"),
            Err(Rejection::MissingName)
        );

        let mut named = PartialRecord::new();
        named.set("name", "Austin High");
        assert_eq!(
            assemble(&named, &profile(), "  "),
            Err(Rejection::MissingSourceUrl)
        );
    }

    #[test]
    fn test_assemble_rejects_non_school_names() {
        let mut partial = PartialRecord::new();
        partial.set("name", "2023 Report Card Overview");
        assert!(matches!(
            assemble(&partial, &profile(), "https://example.test/x"),
            Err(Rejection::RejectedName(_))
        ));
    }

    #[test]
    fn test_partial_set_keeps_existing_value() {
        let mut partial = PartialRecord::new();
        partial.set("city", "");
        assert_eq!(partial.get("city"), Some(""));
        partial.set("city", "Austin");
        partial.set("city", "");
        assert_eq!(partial.get("city"), Some("Austin"));
    }

    #[test]
    fn test_record_get_covers_all_columns() {
        let record = SchoolRecord::default();
        for key in COLUMNS {
            assert_eq!(record.get(key), Some(""));
        }
        assert_eq!(record.get("unknown"), None);
    }
}
