use std::path::PathBuf;
use std::time::Duration;

/// 実行パラメータ (プロファイルの値を上書きするものを含む)
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 出力 CSV のパス。省略時は `data/<site>_<日時>.csv`
    pub output_path: Option<PathBuf>,
    pub headless: bool,
    /// 失敗したページのスクリーンショットをログに出す
    pub debug: bool,
    /// Chrome 実行ファイル (省略時は CHROME_PATH / CHROMIUM_PATH / 自動検出)
    pub chrome_path: Option<PathBuf>,
    pub max_pages: Option<u32>,
    pub max_items: Option<usize>,
    pub page_load_timeout: Option<Duration>,
    pub element_wait_timeout: Option<Duration>,
    pub request_delay: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_path: None,
            headless: true,
            debug: false,
            chrome_path: None,
            max_pages: None,
            max_items: None,
            page_load_timeout: None,
            element_wait_timeout: None,
            request_delay: None,
            max_attempts: None,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    pub fn with_page_load_timeout(mut self, timeout: Duration) -> Self {
        self.page_load_timeout = Some(timeout);
        self
    }

    pub fn with_element_wait_timeout(mut self, timeout: Duration) -> Self {
        self.element_wait_timeout = Some(timeout);
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Chrome 実行ファイル: 明示指定 > CHROME_PATH > CHROMIUM_PATH
    pub fn resolve_chrome_path(&self) -> Option<PathBuf> {
        self.chrome_path.clone().or_else(|| {
            std::env::var("CHROME_PATH")
                .or_else(|_| std::env::var("CHROMIUM_PATH"))
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let options = RunOptions::new()
            .with_output_path("/tmp/out.csv")
            .with_headless(false)
            .with_debug(true)
            .with_max_pages(3)
            .with_max_items(10)
            .with_request_delay(Duration::ZERO);

        assert_eq!(options.output_path, Some(PathBuf::from("/tmp/out.csv")));
        assert!(!options.headless);
        assert!(options.debug);
        assert_eq!(options.max_pages, Some(3));
        assert_eq!(options.max_items, Some(10));
        assert_eq!(options.request_delay, Some(Duration::ZERO));
    }

    #[test]
    fn test_explicit_chrome_path_wins() {
        let options = RunOptions::new().with_chrome_path("/opt/chrome");
        assert_eq!(options.resolve_chrome_path(), Some(PathBuf::from("/opt/chrome")));
    }
}
