use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("必須フィールドが見つかりません: {field} ({url})")]
    FieldMissing { field: String, url: String },

    #[error("詳細ページ取得失敗: {url}: {source}")]
    FetchFailure {
        url: String,
        #[source]
        source: Box<ScraperError>,
    },

    #[error("リトライ上限到達: {operation} ({attempts}回): {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: Box<ScraperError>,
    },

    #[error("ページ送りが進みません: page={page}, 収集済みリンク={collected}")]
    PaginationStuck { page: u32, collected: usize },

    #[error("フィルター適用失敗: {0}")]
    FilterApply(String),

    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("要素が見つかりません: {0}")]
    ElementNotFound(String),

    #[error("要素参照が無効: {0}")]
    StaleElement(String),

    #[error("JavaScript実行エラー: {0}")]
    JavaScript(String),

    #[error("名前解決エラー: {0}")]
    Dns(String),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("CSV出力エラー: {0}")]
    Csv(#[from] csv::Error),

    #[error("実行が中断されました")]
    Cancelled,
}

impl ScraperError {
    /// 再試行で回復しうる一時的な失敗か
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScraperError::Timeout(_)
                | ScraperError::ElementNotFound(_)
                | ScraperError::StaleElement(_)
                | ScraperError::Navigation(_)
                | ScraperError::JavaScript(_)
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        ScraperError::Config(message.into())
    }
}

impl From<serde_yaml::Error> for ScraperError {
    fn from(e: serde_yaml::Error) -> Self {
        ScraperError::Config(format!("YAML解析エラー: {}", e))
    }
}

/// スキップ理由の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipKind {
    FieldMissing,
    FetchFailure,
    InvalidRecord,
}

impl fmt::Display for SkipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipKind::FieldMissing => "field_missing",
            SkipKind::FetchFailure => "fetch_failure",
            SkipKind::InvalidRecord => "invalid_record",
        };
        f.write_str(s)
    }
}

/// スキップされた1件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skip {
    pub url: String,
    pub kind: SkipKind,
    pub reason: String,
}

impl Skip {
    pub fn new(url: impl Into<String>, kind: SkipKind, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// 操作ごとの結果。継続/中断の判断は呼び出し側が行う
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Skipped(Skip),
    Fatal(ScraperError),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ScraperError::Timeout("wait".into()).is_retryable());
        assert!(ScraperError::StaleElement("node".into()).is_retryable());
        assert!(!ScraperError::Config("bad".into()).is_retryable());
        assert!(!ScraperError::Dns("host".into()).is_retryable());
        assert!(!ScraperError::Cancelled.is_retryable());
    }

    #[test]
    fn test_retries_exhausted_keeps_last_error() {
        let e = ScraperError::RetriesExhausted {
            operation: "goto".into(),
            attempts: 3,
            last_error: Box::new(ScraperError::Timeout("page load".into())),
        };
        let msg = e.to_string();
        assert!(msg.contains("goto"));
        assert!(msg.contains("3"));
        assert!(msg.contains("page load"));
    }
}
