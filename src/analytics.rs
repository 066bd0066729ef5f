//! Advisory usage records. Nothing here affects query results or rebuilds;
//! write failures are logged and otherwise ignored by callers.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::error::Result;
use crate::semantic::snapshot::GenerationId;
use crate::storage::BackendLocal;

pub const BUILD_ANALYTICS_FILE: &str = "analytics.json";
pub const QUERY_LOG_FILE: &str = "queries.jsonl";
/// Totals folded out of rotated query logs
pub const QUERY_TOTALS_FILE: &str = "query_totals.json";

/// Size at which the query log is folded into the totals and started over
const DEFAULT_MAX_QUERY_LOG_BYTES: u64 = 4 * 1024 * 1024;

/// Confidence histogram buckets of 10 points each
pub const HISTOGRAM_BUCKETS: usize = 10;

/// One line of `queries.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEvent {
    pub ts: DateTime<Utc>,
    pub generation: Option<GenerationId>,
    pub k: usize,
    pub min_confidence: f32,
    /// Confidence of every candidate before filtering
    pub candidate_confidences: Vec<f32>,
    pub returned: usize,
    pub latency_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryStats {
    pub queries: u64,
    pub empty_results: u64,
    pub results_returned: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub confidence_histogram: [u64; HISTOGRAM_BUCKETS],
}

/// Raw counters as persisted in `query_totals.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTotals {
    pub queries: u64,
    pub empty_results: u64,
    pub results_returned: u64,
    pub total_latency_us: u64,
    pub max_latency_us: u64,
    pub confidence_histogram: [u64; HISTOGRAM_BUCKETS],
}

impl QueryTotals {
    pub fn load(store: &BackendLocal) -> Self {
        let bytes = match store.read(QUERY_TOTALS_FILE) {
            Ok(bytes) => bytes,
            Err(_) => return Self::default(),
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            log::warn!("ignoring malformed {QUERY_TOTALS_FILE}: {err}");
            Self::default()
        })
    }

    fn merge(&mut self, other: &QueryTotals) {
        self.queries += other.queries;
        self.empty_results += other.empty_results;
        self.results_returned += other.results_returned;
        self.total_latency_us += other.total_latency_us;
        self.max_latency_us = self.max_latency_us.max(other.max_latency_us);
        for (slot, add) in self
            .confidence_histogram
            .iter_mut()
            .zip(other.confidence_histogram.iter())
        {
            *slot += add;
        }
    }
}

/// Per-query counters shared by concurrent queries.
#[derive(Debug, Default)]
pub struct QueryAnalytics {
    queries: AtomicU64,
    empty_results: AtomicU64,
    results_returned: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
    confidence_histogram: [AtomicU64; HISTOGRAM_BUCKETS],
    log: Option<QueryLog>,
}

/// Append-only event log in an index directory, folded into
/// `query_totals.json` once it grows past `max_bytes`.
#[derive(Debug)]
struct QueryLog {
    store: BackendLocal,
    max_bytes: u64,
}

impl QueryAnalytics {
    /// Counters that also append every event to the query log in `dir`.
    pub fn with_log(dir: &Path) -> Result<Self> {
        Ok(Self {
            log: Some(QueryLog {
                store: BackendLocal::new(dir)?,
                max_bytes: DEFAULT_MAX_QUERY_LOG_BYTES,
            }),
            ..Self::default()
        })
    }

    pub fn with_max_log_bytes(mut self, max_bytes: u64) -> Self {
        if let Some(query_log) = self.log.as_mut() {
            query_log.max_bytes = max_bytes;
        }
        self
    }

    pub fn record(&self, event: &QueryEvent) {
        self.count(event);

        if let Some(query_log) = &self.log {
            let path = query_log.store.path(QUERY_LOG_FILE);
            if let Err(err) = append_event(&path, event) {
                log::warn!("failed to append query event to {:?}: {err}", path);
            }
            if let Err(err) = query_log.rotate_if_full() {
                log::warn!("failed to rotate query log {:?}: {err}", path);
            }
        }
    }

    fn add_totals(&self, totals: &QueryTotals) {
        self.queries.fetch_add(totals.queries, Ordering::Relaxed);
        self.empty_results
            .fetch_add(totals.empty_results, Ordering::Relaxed);
        self.results_returned
            .fetch_add(totals.results_returned, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(totals.total_latency_us, Ordering::Relaxed);
        self.max_latency_us
            .fetch_max(totals.max_latency_us, Ordering::Relaxed);
        for (counter, add) in self
            .confidence_histogram
            .iter()
            .zip(totals.confidence_histogram.iter())
        {
            counter.fetch_add(*add, Ordering::Relaxed);
        }
    }

    pub fn totals(&self) -> QueryTotals {
        let mut histogram = [0u64; HISTOGRAM_BUCKETS];
        for (slot, counter) in histogram.iter_mut().zip(self.confidence_histogram.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        QueryTotals {
            queries: self.queries.load(Ordering::Relaxed),
            empty_results: self.empty_results.load(Ordering::Relaxed),
            results_returned: self.results_returned.load(Ordering::Relaxed),
            total_latency_us: self.total_latency_us.load(Ordering::Relaxed),
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
            confidence_histogram: histogram,
        }
    }

    fn count(&self, event: &QueryEvent) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if event.returned == 0 {
            self.empty_results.fetch_add(1, Ordering::Relaxed);
        }
        self.results_returned
            .fetch_add(event.returned as u64, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(event.latency_us, Ordering::Relaxed);
        self.max_latency_us
            .fetch_max(event.latency_us, Ordering::Relaxed);

        for &confidence in &event.candidate_confidences {
            self.confidence_histogram[bucket(confidence)].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> QueryStats {
        let totals = self.totals();
        QueryStats {
            queries: totals.queries,
            empty_results: totals.empty_results,
            results_returned: totals.results_returned,
            avg_latency_us: totals.total_latency_us.checked_div(totals.queries).unwrap_or(0),
            max_latency_us: totals.max_latency_us,
            confidence_histogram: totals.confidence_histogram,
        }
    }

    /// Everything recorded in `dir`: the folded totals plus the live log.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let analytics = Self::from_log(&dir.join(QUERY_LOG_FILE))?;
        analytics.add_totals(&QueryTotals::load(&BackendLocal::new(dir)?));
        Ok(analytics)
    }

    /// Totals over every event in a query log. Malformed lines are skipped.
    fn from_log(path: &Path) -> Result<Self> {
        let analytics = Self::default();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(analytics),
            Err(err) => return Err(err.into()),
        };

        for line in BufReader::new(file).lines() {
            let line = line?;
            match serde_json::from_str::<QueryEvent>(&line) {
                Ok(event) => analytics.count(&event),
                Err(err) => log::debug!("skipping malformed query event: {err}"),
            }
        }
        Ok(analytics)
    }
}

impl QueryLog {
    /// Fold a full log into the totals. The rename picks one winner when
    /// several processes rotate at once.
    fn rotate_if_full(&self) -> Result<()> {
        let path = self.store.path(QUERY_LOG_FILE);
        let len = match std::fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if len < self.max_bytes {
            return Ok(());
        }

        let rotating = self.store.path(&format!(".{}-{QUERY_LOG_FILE}", Eid::new()));
        match std::fs::rename(&path, &rotating) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let folded = QueryAnalytics::from_log(&rotating)?.totals();
        let mut totals = QueryTotals::load(&self.store);
        totals.merge(&folded);
        self.store
            .write(QUERY_TOTALS_FILE, &serde_json::to_vec_pretty(&totals)?)?;
        std::fs::remove_file(&rotating)?;

        log::debug!("folded {} query events out of {:?}", folded.queries, path);
        Ok(())
    }
}

fn bucket(confidence: f32) -> usize {
    if !confidence.is_finite() || confidence <= 0.0 {
        return 0;
    }
    ((confidence / 10.0) as usize).min(HISTOGRAM_BUCKETS - 1)
}

fn append_event(path: &Path, event: &QueryEvent) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');

    // one write per event keeps concurrent appends from interleaving
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)
}

/// Outcome of past rebuilds, kept in `analytics.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildAnalytics {
    pub last_attempt_ts: Option<DateTime<Utc>>,
    pub last_success_ts: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub build_count: u64,
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_generation: Option<GenerationId>,
}

impl BuildAnalytics {
    pub fn load(store: &BackendLocal) -> Self {
        let bytes = match store.read(BUILD_ANALYTICS_FILE) {
            Ok(bytes) => bytes,
            Err(_) => return Self::default(),
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            log::warn!("ignoring malformed {BUILD_ANALYTICS_FILE}: {err}");
            Self::default()
        })
    }

    /// Read-modify-write of the record. Only the write-lock holder calls this.
    pub fn update(store: &BackendLocal, update: impl FnOnce(&mut BuildAnalytics)) -> Result<()> {
        let mut analytics = Self::load(store);
        update(&mut analytics);
        store.write(BUILD_ANALYTICS_FILE, &serde_json::to_vec_pretty(&analytics)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn event(returned: usize, latency_us: u64, confidences: &[f32]) -> QueryEvent {
        QueryEvent {
            ts: Utc::now(),
            generation: Some(GenerationId(1)),
            k: 5,
            min_confidence: 60.0,
            candidate_confidences: confidences.to_vec(),
            returned,
            latency_us,
        }
    }

    #[test]
    fn test_counters() {
        let analytics = QueryAnalytics::default();
        analytics.record(&event(2, 100, &[95.0, 61.0, 12.0]));
        analytics.record(&event(0, 300, &[5.0]));

        let stats = analytics.stats();
        assert_eq!(stats.queries, 2);
        assert_eq!(stats.empty_results, 1);
        assert_eq!(stats.results_returned, 2);
        assert_eq!(stats.avg_latency_us, 200);
        assert_eq!(stats.max_latency_us, 300);
        assert_eq!(stats.confidence_histogram[9], 1);
        assert_eq!(stats.confidence_histogram[6], 1);
        assert_eq!(stats.confidence_histogram[1], 1);
        assert_eq!(stats.confidence_histogram[0], 1);
    }

    #[test]
    fn test_histogram_edges() {
        assert_eq!(bucket(0.0), 0);
        assert_eq!(bucket(9.99), 0);
        assert_eq!(bucket(10.0), 1);
        assert_eq!(bucket(100.0), 9);
        assert_eq!(bucket(f32::NAN), 0);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let analytics = Arc::new(QueryAnalytics::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let analytics = analytics.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        analytics.record(&event(1, 10, &[50.0]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = analytics.stats();
        assert_eq!(stats.queries, 4000);
        assert_eq!(stats.results_returned, 4000);
        assert_eq!(stats.confidence_histogram[5], 4000);
    }

    #[test]
    fn test_query_log_round_trip() {
        let tmp = tempfile::tempdir().unwrap();

        let analytics = QueryAnalytics::with_log(tmp.path()).unwrap();
        analytics.record(&event(1, 40, &[70.0]));
        analytics.record(&event(0, 60, &[]));

        let lines = std::fs::read_to_string(tmp.path().join(QUERY_LOG_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 2);

        let replayed = QueryAnalytics::from_dir(tmp.path()).unwrap();
        assert_eq!(replayed.stats(), analytics.stats());
    }

    #[test]
    fn test_full_query_log_is_folded_into_totals() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join(QUERY_LOG_FILE);

        let analytics = QueryAnalytics::with_log(tmp.path())
            .unwrap()
            .with_max_log_bytes(1024);
        for i in 0..50 {
            analytics.record(&event(i % 3, 10 + i as u64, &[42.0, 88.0]));
        }

        let log_len = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
        assert!(log_len < 1024);
        assert!(tmp.path().join(QUERY_TOTALS_FILE).exists());

        let replayed = QueryAnalytics::from_dir(tmp.path()).unwrap();
        assert_eq!(replayed.stats(), analytics.stats());
        assert_eq!(replayed.stats().queries, 50);

        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_totals_merge() {
        let mut totals = QueryTotals {
            queries: 2,
            max_latency_us: 50,
            ..QueryTotals::default()
        };
        totals.confidence_histogram[3] = 1;
        let mut other = QueryTotals {
            queries: 3,
            max_latency_us: 20,
            total_latency_us: 60,
            ..QueryTotals::default()
        };
        other.confidence_histogram[3] = 2;

        totals.merge(&other);
        assert_eq!(totals.queries, 5);
        assert_eq!(totals.max_latency_us, 50);
        assert_eq!(totals.total_latency_us, 60);
        assert_eq!(totals.confidence_histogram[3], 3);
    }

    #[test]
    fn test_build_analytics_update() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        assert_eq!(BuildAnalytics::load(&store), BuildAnalytics::default());

        BuildAnalytics::update(&store, |a| {
            a.build_count += 1;
            a.last_error = Some("boom".to_string());
        })
        .unwrap();
        BuildAnalytics::update(&store, |a| a.build_count += 1).unwrap();

        let loaded = BuildAnalytics::load(&store);
        assert_eq!(loaded.build_count, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_malformed_build_analytics_resets() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(BUILD_ANALYTICS_FILE), "{not json").unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        assert_eq!(BuildAnalytics::load(&store), BuildAnalytics::default());
    }
}
