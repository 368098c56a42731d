use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tower::Service;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use school_scraper::{
    CancelFlag, RunOptions, RunStatus, ScrapeRequest, ScraperService, SiteProfile,
};

/// 学校ディレクトリ スクレイパー
#[derive(Debug, Parser)]
#[command(name = "school-scraper", version, about)]
struct Args {
    /// サイトプロファイル (YAML)
    #[arg(short, long)]
    profile: PathBuf,

    /// 出力 CSV (省略時は OUTPUT_PATH、なければ data/<site>_<日時>.csv)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// ヘッドレスで実行 (既定。HEADLESS_BROWSER=false で無効)
    #[arg(long, conflicts_with = "headed")]
    headless: bool,

    /// ブラウザ画面を表示して実行
    #[arg(long)]
    headed: bool,

    /// 一覧ページ数の上限
    #[arg(long)]
    max_pages: Option<u32>,

    /// 取得件数の上限
    #[arg(long)]
    max_items: Option<usize>,

    /// 1ページあたりの読み込みタイムアウト（秒）
    #[arg(long)]
    timeout: Option<u64>,

    /// 失敗ページのスクリーンショットをログに出す
    #[arg(long)]
    debug: bool,

    /// 詳細ログ
    #[arg(short, long)]
    verbose: bool,

    /// プロファイルの検証のみ行う
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // ランタイム起動前に読む (set_var はシングルスレッドの間に行う)
    load_dotenv(Path::new(".env"));
    init_tracing(args.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("エラー: ランタイム初期化失敗: {}", e);
            return ExitCode::from(RunStatus::Aborted.exit_code() as u8);
        }
    };

    let code = runtime.block_on(run(args));
    ExitCode::from(code as u8)
}

async fn run(args: Args) -> i32 {
    if args.check {
        return match SiteProfile::load(&args.profile) {
            Ok(profile) => {
                println!(
                    "OK: {} ({} fields, {} pagination, {} filters)",
                    profile.site(),
                    profile.fields().len(),
                    profile.pagination().mode(),
                    profile.filters().len()
                );
                0
            }
            Err(e) => {
                eprintln!("エラー: {}", e);
                RunStatus::Aborted.exit_code()
            }
        };
    }

    let options = run_options(&args);
    let cancel = CancelFlag::new();

    let signal_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current page and writing collected records...");
            signal_flag.cancel();
        }
    });

    let mut service = ScraperService::new().with_cancel_flag(cancel);
    let request = ScrapeRequest::new(args.profile.clone()).with_options(options);

    match service.call(request).await {
        Ok(result) => {
            println!("{}", result.report.summary());
            println!("出力: {}", result.output_path.display());
            for skip in &result.report.skipped {
                info!("skipped [{}] {}: {}", skip.kind, skip.url, skip.reason);
            }
            result.status().exit_code()
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("エラー: {}", e);
            RunStatus::Aborted.exit_code()
        }
    }
}

fn run_options(args: &Args) -> RunOptions {
    let headless = if args.headed {
        false
    } else if args.headless {
        true
    } else {
        std::env::var("HEADLESS_BROWSER")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true)
    };

    let mut options = RunOptions::new()
        .with_headless(headless)
        .with_debug(args.debug);

    let output = args
        .output
        .clone()
        .or_else(|| std::env::var("OUTPUT_PATH").ok().map(PathBuf::from));
    if let Some(output) = output {
        options = options.with_output_path(output);
    }
    if let Some(max_pages) = args.max_pages {
        options = options.with_max_pages(max_pages);
    }
    if let Some(max_items) = args.max_items {
        options = options.with_max_items(max_items);
    }
    if let Some(secs) = args.timeout {
        options = options.with_page_load_timeout(Duration::from_secs(secs));
    }
    options
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,school_scraper=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `KEY=VALUE` 形式の .env を読み、未設定の環境変数だけ設定する
fn load_dotenv(path: &Path) {
    let Ok(text) = std::fs::read_to_string(path) else {
        return;
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !key.is_empty() && std::env::var_os(key).is_none() {
                std::env::set_var(key, value);
            }
        }
    }
}
