//! Replay data sources: in-memory tapes and CSV bar files.

use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::replay::{Bar, ReplaySource};

/// In-memory tape. Items must be pre-sorted by timestamp.
pub struct VecSource {
    items: Vec<(i64, Bar)>,
    cursor: usize,
}

impl VecSource {
    pub fn new(items: Vec<(i64, Bar)>) -> Self {
        Self { items, cursor: 0 }
    }
}

impl ReplaySource for VecSource {
    fn next_point(&mut self) -> Option<(i64, Bar)> {
        let item = self.items.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(item)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }

    fn rewind(&mut self) -> bool {
        self.cursor = 0;
        true
    }
}

/// Streaming CSV bar source. Expected header:
/// `timestamp,symbol,open,high,low,close,volume` with `timestamp` in unix ms.
/// When the file has no `symbol` column, a default symbol must be supplied.
///
/// Rows that fail to parse are logged and skipped; an unreadable file yields
/// an empty source. The file is re-opened on rewind.
pub struct CsvBarSource {
    path: PathBuf,
    default_symbol: Option<String>,
    reader: Option<csv::Reader<std::fs::File>>,
    rows_estimate: Option<usize>,
}

impl CsvBarSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut source = Self {
            path: path.as_ref().to_path_buf(),
            default_symbol: None,
            reader: None,
            rows_estimate: None,
        };
        source.open();
        source
    }

    pub fn with_symbol(path: impl AsRef<Path>, symbol: impl Into<String>) -> Self {
        let mut source = Self {
            path: path.as_ref().to_path_buf(),
            default_symbol: Some(symbol.into()),
            reader: None,
            rows_estimate: None,
        };
        source.open();
        source
    }

    fn open(&mut self) {
        match csv::Reader::from_path(&self.path) {
            Ok(reader) => self.reader = Some(reader),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to open csv source");
                self.reader = None;
            }
        }
    }

    fn parse_record(&self, headers: &csv::StringRecord, record: &csv::StringRecord) -> Option<(i64, Bar)> {
        let field = |name: &str| -> Option<&str> {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .and_then(|i| record.get(i))
        };
        let timestamp: i64 = field("timestamp")?.trim().parse().ok()?;
        let symbol = field("symbol")
            .map(|s| s.trim().to_string())
            .or_else(|| self.default_symbol.clone())?;
        let decimal = |name: &str| -> Option<Decimal> { field(name)?.trim().parse().ok() };
        let close = decimal("close")?;
        Some((
            timestamp,
            Bar {
                symbol,
                open: decimal("open").unwrap_or(close),
                high: decimal("high").unwrap_or(close),
                low: decimal("low").unwrap_or(close),
                close,
                volume: decimal("volume").unwrap_or(Decimal::ZERO),
            },
        ))
    }
}

impl ReplaySource for CsvBarSource {
    fn next_point(&mut self) -> Option<(i64, Bar)> {
        loop {
            let reader = self.reader.as_mut()?;
            let headers = match reader.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "csv header error");
                    self.reader = None;
                    return None;
                }
            };
            let mut record = csv::StringRecord::new();
            match reader.read_record(&mut record) {
                Ok(true) => {
                    if let Some(item) = self.parse_record(&headers, &record) {
                        return Some(item);
                    }
                    warn!(path = %self.path.display(), row = ?record, "skipping malformed csv row");
                }
                Ok(false) => return None,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "csv read error; source exhausted");
                    self.reader = None;
                    return None;
                }
            }
        }
    }

    fn size_hint(&self) -> Option<usize> {
        self.rows_estimate
    }

    fn rewind(&mut self) -> bool {
        self.open();
        self.reader.is_some()
    }
}
