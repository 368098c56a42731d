//! CSV 出力

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::info;

use crate::error::ScraperError;
use crate::record::SchoolRecord;

/// 出力ファイルの既定ディレクトリ
pub const DEFAULT_OUTPUT_DIR: &str = "data";

/// `data/<site>_<YYYYmmdd_HHMMSS>.csv`
pub fn default_output_path(site: &str, now: DateTime<Local>) -> PathBuf {
    let site: String = site
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    PathBuf::from(DEFAULT_OUTPUT_DIR).join(format!(
        "{}_{}.csv",
        site,
        now.format("%Y%m%d_%H%M%S")
    ))
}

/// プロファイルの列順でレコードを書き出す
pub struct CsvExporter {
    columns: Vec<String>,
}

impl CsvExporter {
    pub fn new(columns: &[String]) -> Self {
        Self {
            columns: columns.to_vec(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn write<W: Write>(
        &self,
        writer: W,
        records: &[SchoolRecord],
    ) -> Result<usize, ScraperError> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(&self.columns)?;
        for record in records {
            csv.write_record(
                self.columns
                    .iter()
                    .map(|c| record.get(c).unwrap_or_default()),
            )?;
        }
        csv.flush()?;
        Ok(records.len())
    }

    /// 親ディレクトリを作成してファイルに書く
    pub fn write_path(&self, path: &Path, records: &[SchoolRecord]) -> Result<usize, ScraperError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let written = self.write(file, records)?;
        info!("Wrote {} records to {}", written, path.display());
        Ok(written)
    }
}
