//! Market data loading
//!
//! Loads OHLCV bars from CSV files into [`MarketSnapshot`] series, one file per
//! symbol, and serves them through the [`SnapshotProvider`] boundary.
//!
//! CSV layout: `datetime,open,high,low,close,volume` followed by any number of
//! extra columns. Numeric extras become indicators, `pattern_<name>` columns
//! become pattern flags. Missing standard indicators are computed with
//! [`crate::indicators::enrich`].

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::DataUnavailable;
use crate::{indicators, Bar, MarketSnapshot, Symbol};

const PATTERN_PREFIX: &str = "pattern_";

/// Inclusive date filter applied after indicators are computed, so warmup
/// can use bars before `start`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Parse optional `YYYY-MM-DD` bounds; `end` covers the whole day
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        let start = start
            .map(|s| parse_day(s).map(start_of_day))
            .transpose()?;
        let end = end
            .map(|s| {
                parse_day(s).and_then(|d| {
                    d.and_hms_opt(23, 59, 59)
                        .map(|dt| dt.and_utc())
                        .context("invalid end of day")
                })
            })
            .transpose()?;
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                bail!("start date {} is after end date {}", s.date_naive(), e.date_naive());
            }
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::default()).and_utc()
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").with_context(|| format!("Invalid date: {}", s))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` and unix epochs
/// (seconds, or milliseconds when the value is large)
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Some(dt);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ndt.and_utc());
        }
    }
    if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(start_of_day(day));
    }
    let epoch: i64 = s.parse().ok()?;
    if epoch.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "1.0" => Some(true),
        "false" | "0" | "0.0" => Some(false),
        _ => None,
    }
}

enum Column {
    Indicator(String),
    Pattern(String),
}

/// Load one symbol's CSV file, sorted by timestamp with duplicates dropped.
///
/// Rows that fail to parse or validate are skipped with a warning.
pub fn load_csv(path: impl AsRef<Path>, symbol: &Symbol) -> Result<Vec<MarketSnapshot>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let headers = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect::<Vec<_>>();

    let find = |names: &[&str]| headers.iter().position(|h| names.contains(&h.as_str()));
    let time_col = find(&["datetime", "timestamp", "date", "time"])
        .context("Missing datetime column")?;
    let ohlcv = [
        find(&["open"]).context("Missing open column")?,
        find(&["high"]).context("Missing high column")?,
        find(&["low"]).context("Missing low column")?,
        find(&["close"]).context("Missing close column")?,
        find(&["volume"]).context("Missing volume column")?,
    ];

    let extras: Vec<(usize, Column)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != time_col && !ohlcv.contains(i))
        .filter(|(_, h)| !h.is_empty())
        .map(|(i, h)| match h.strip_prefix(PATTERN_PREFIX) {
            Some(name) => (i, Column::Pattern(name.to_string())),
            None => (i, Column::Indicator(h.clone())),
        })
        .collect();

    let mut snapshots = Vec::new();
    let mut skipped = 0usize;

    for (row_idx, result) in reader.records().enumerate() {
        let line = row_idx + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(file = %path.display(), line, error = %e, "Skipping unreadable row");
                skipped += 1;
                continue;
            }
        };

        let Some(timestamp) = record.get(time_col).and_then(parse_timestamp) else {
            warn!(file = %path.display(), line, "Skipping row with invalid datetime");
            skipped += 1;
            continue;
        };
        let values: Option<Vec<f64>> = ohlcv
            .iter()
            .map(|&i| record.get(i).and_then(|v| v.parse::<f64>().ok()))
            .collect();
        let Some(values) = values else {
            warn!(file = %path.display(), line, "Skipping row with missing OHLCV value");
            skipped += 1;
            continue;
        };

        let bar = match Bar::new(timestamp, values[0], values[1], values[2], values[3], values[4]) {
            Ok(bar) => bar,
            Err(e) => {
                warn!(file = %path.display(), line, error = %e, "Skipping invalid bar");
                skipped += 1;
                continue;
            }
        };

        let mut snapshot = MarketSnapshot::from_bar(symbol.clone(), &bar);
        for (i, column) in &extras {
            let Some(cell) = record.get(*i).filter(|c| !c.is_empty()) else {
                continue;
            };
            match column {
                Column::Indicator(name) => {
                    if let Some(v) = cell.parse::<f64>().ok().filter(|v| v.is_finite()) {
                        snapshot.indicators.insert(name.clone(), v);
                    }
                }
                Column::Pattern(name) => {
                    if let Some(flag) = parse_flag(cell) {
                        snapshot.patterns.insert(name.clone(), flag);
                    }
                }
            }
        }
        snapshots.push(snapshot);
    }

    snapshots.sort_by_key(|s| s.timestamp);
    let before = snapshots.len();
    snapshots.dedup_by_key(|s| s.timestamp);
    if snapshots.len() < before {
        warn!(symbol = %symbol, dropped = before - snapshots.len(), "Dropped duplicate timestamps");
    }
    if skipped > 0 {
        warn!(symbol = %symbol, skipped, "Skipped invalid rows");
    }

    Ok(snapshots)
}

/// Locate a symbol's file: `<SYMBOL>_<timeframe>.csv`, then `<SYMBOL>.csv`
pub fn symbol_file(data_dir: &Path, symbol: &Symbol, timeframe: Option<&str>) -> Option<PathBuf> {
    let mut candidates = Vec::with_capacity(2);
    if let Some(tf) = timeframe.filter(|tf| !tf.is_empty()) {
        candidates.push(data_dir.join(format!("{}_{}.csv", symbol, tf)));
    }
    candidates.push(data_dir.join(format!("{}.csv", symbol)));
    candidates.into_iter().find(|p| p.is_file())
}

/// Per-symbol snapshot series, oldest first
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    series: BTreeMap<Symbol, Vec<MarketSnapshot>>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a series; it is sorted by timestamp with duplicates removed
    pub fn insert(&mut self, symbol: Symbol, mut snapshots: Vec<MarketSnapshot>) {
        snapshots.sort_by_key(|s| s.timestamp);
        snapshots.dedup_by_key(|s| s.timestamp);
        self.series.insert(symbol, snapshots);
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.series.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &[MarketSnapshot])> {
        self.series.iter().map(|(s, v)| (s, v.as_slice()))
    }

    pub fn series(&self, symbol: &Symbol) -> Option<&[MarketSnapshot]> {
        self.series.get(symbol).map(Vec::as_slice)
    }

    /// Sorted union of every symbol's timestamps
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.series
            .values()
            .flatten()
            .map(|s| s.timestamp)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Bars at or before `ts`; never includes later data
    pub fn history_until(&self, symbol: &Symbol, ts: DateTime<Utc>) -> &[MarketSnapshot] {
        match self.series.get(symbol) {
            Some(series) => {
                let n = series.partition_point(|s| s.timestamp <= ts);
                &series[..n]
            }
            None => &[],
        }
    }

    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.series
            .values()
            .filter_map(|s| s.last().map(|b| b.timestamp))
            .max()
    }

    /// Add the standard indicator set to every series
    pub fn enrich(&mut self) {
        self.series
            .par_iter_mut()
            .for_each(|(_, series)| indicators::enrich(series));
    }

    /// Drop bars outside `range`
    pub fn retain_range(&mut self, range: &DateRange) {
        for series in self.series.values_mut() {
            series.retain(|s| range.contains(s.timestamp));
        }
        self.series.retain(|_, series| !series.is_empty());
    }
}

/// Load every requested symbol from `data_dir` in parallel.
///
/// Missing files are skipped with a warning; it is an error if nothing loads.
pub fn load_directory(
    data_dir: impl AsRef<Path>,
    symbols: &[Symbol],
    timeframe: Option<&str>,
    range: &DateRange,
) -> Result<MarketData> {
    let data_dir = data_dir.as_ref();
    let loaded: Vec<(Symbol, Result<Vec<MarketSnapshot>>)> = symbols
        .par_iter()
        .filter_map(|symbol| match symbol_file(data_dir, symbol, timeframe) {
            Some(path) => {
                let result = load_csv(&path, symbol).map(|mut series| {
                    indicators::enrich(&mut series);
                    series
                });
                Some((symbol.clone(), result))
            }
            None => {
                warn!(symbol = %symbol, dir = %data_dir.display(), "Data file not found");
                None
            }
        })
        .collect();

    let mut data = MarketData::new();
    for (symbol, result) in loaded {
        let series = result.with_context(|| format!("Failed to load data for {}", symbol))?;
        debug!(symbol = %symbol, bars = series.len(), "Loaded series");
        data.insert(symbol, series);
    }
    data.retain_range(range);

    if data.is_empty() {
        bail!("No data loaded for any symbol from {}", data_dir.display());
    }
    for (symbol, series) in data.iter() {
        info!("Loaded {} bars for {}", series.len(), symbol);
    }
    Ok(data)
}

/// Source of per-symbol market snapshots
pub trait SnapshotProvider: Send {
    fn symbols(&self) -> Vec<Symbol>;

    /// Latest snapshot at or before `ts`
    fn snapshot(&self, symbol: &Symbol, ts: DateTime<Utc>) -> Result<MarketSnapshot, DataUnavailable>;

    /// Up to `max_bars` snapshots ending at or before `ts`, oldest first
    fn history(
        &self,
        symbol: &Symbol,
        ts: DateTime<Utc>,
        max_bars: usize,
    ) -> Result<Vec<MarketSnapshot>, DataUnavailable>;

    fn latest_timestamp(&self) -> Option<DateTime<Utc>>;

    /// Pick up new data, if the source has any
    fn refresh(&mut self) -> Result<(), DataUnavailable> {
        Ok(())
    }
}

impl SnapshotProvider for MarketData {
    fn symbols(&self) -> Vec<Symbol> {
        self.series.keys().cloned().collect()
    }

    fn snapshot(&self, symbol: &Symbol, ts: DateTime<Utc>) -> Result<MarketSnapshot, DataUnavailable> {
        self.history_until(symbol, ts)
            .last()
            .cloned()
            .ok_or_else(|| DataUnavailable::NoSnapshot {
                symbol: symbol.clone(),
            })
    }

    fn history(
        &self,
        symbol: &Symbol,
        ts: DateTime<Utc>,
        max_bars: usize,
    ) -> Result<Vec<MarketSnapshot>, DataUnavailable> {
        let visible = self.history_until(symbol, ts);
        if visible.is_empty() {
            return Err(DataUnavailable::NoSnapshot {
                symbol: symbol.clone(),
            });
        }
        let start = visible.len().saturating_sub(max_bars);
        Ok(visible[start..].to_vec())
    }

    fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        MarketData::latest_timestamp(self)
    }
}

/// CSV directory that is re-read on every [`SnapshotProvider::refresh`]
#[derive(Debug, Clone)]
pub struct CsvDirectoryProvider {
    data_dir: PathBuf,
    symbols: Vec<Symbol>,
    timeframe: Option<String>,
    data: MarketData,
}

impl CsvDirectoryProvider {
    pub fn new(data_dir: impl Into<PathBuf>, symbols: Vec<Symbol>, timeframe: Option<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            symbols,
            timeframe,
            data: MarketData::new(),
        }
    }

    pub fn data(&self) -> &MarketData {
        &self.data
    }
}

impl SnapshotProvider for CsvDirectoryProvider {
    fn symbols(&self) -> Vec<Symbol> {
        self.symbols.clone()
    }

    fn snapshot(&self, symbol: &Symbol, ts: DateTime<Utc>) -> Result<MarketSnapshot, DataUnavailable> {
        self.data.snapshot(symbol, ts)
    }

    fn history(
        &self,
        symbol: &Symbol,
        ts: DateTime<Utc>,
        max_bars: usize,
    ) -> Result<Vec<MarketSnapshot>, DataUnavailable> {
        self.data.history(symbol, ts, max_bars)
    }

    fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.data.latest_timestamp()
    }

    fn refresh(&mut self) -> Result<(), DataUnavailable> {
        let loaded = load_directory(
            &self.data_dir,
            &self.symbols,
            self.timeframe.as_deref(),
            &DateRange::default(),
        )
        .map_err(|e| DataUnavailable::MissingInput(format!("{:#}", e)))?;
        self.data = loaded;
        Ok(())
    }
}
