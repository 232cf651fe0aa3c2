//! # Progressive Loader
//!
//! Reads a large collection in fixed windows without ever trusting a single
//! response to hold everything.
//!
//! ## Sequential Load
//! ```text
//! page_size = min(configured, 1000)
//!
//! offset 0      ─► 1000 rows ─► progress(1000/2500)   yield
//! offset 1000   ─► 1000 rows ─► progress(2000/2500)   yield
//! offset 2000   ─►  500 rows ─► progress(2500/2500)   short page → Complete
//! ```
//!
//! A load stops on the first short page or once the known total is reached.
//! A failing page stops it too, and the report comes back `Partial` with the
//! rows gathered so far. A partial load is never reported complete.
//!
//! ## Concurrent Load
//! With `concurrency > 1` and a known total, all windows are planned up front
//! and fetched `concurrency` at a time. Pages land in a map keyed by offset,
//! so the order responses arrive in cannot change the result.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use ts_rs::TS;

use crate::error::{SyncError, SyncResult};
use inventra_core::MAX_PAGE_SIZE;

// =============================================================================
// Options & Progress
// =============================================================================

/// How a collection is read.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Requested window size; clamped to [`MAX_PAGE_SIZE`].
    pub page_size: usize,
    /// Windows in flight at once (only with a known total).
    pub concurrency: usize,
    /// Hand rows-so-far to the caller every N rows.
    pub progress_every: usize,
    /// Total rows, if known beforehand.
    pub total: Option<usize>,
    /// Deadline for each page request.
    pub request_timeout: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            page_size: MAX_PAGE_SIZE,
            concurrency: 1,
            progress_every: 5_000,
            total: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl LoaderOptions {
    pub fn with_total(mut self, total: Option<usize>) -> Self {
        self.total = total;
        self
    }

    fn effective_page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

/// Where a load currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Fetching,
    Complete,
    Partial,
}

/// Progress reported after every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LoadProgress {
    #[ts(type = "number")]
    pub current: usize,
    #[ts(type = "number | null")]
    pub total: Option<usize>,
    pub phase: LoadPhase,
}

/// Whether a load got everything.
#[derive(Debug)]
pub enum Completeness {
    Complete,
    /// Stopped early; the rows are only what arrived before the error.
    Partial(SyncError),
}

/// Result of a load. Always carries the rows obtained.
#[derive(Debug)]
pub struct LoadReport {
    pub rows: Vec<Value>,
    pub requests: usize,
    pub completeness: Completeness,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.completeness, Completeness::Complete)
    }

    /// Converts a partial report into its error, keeping complete rows.
    pub fn into_complete(self) -> SyncResult<(Vec<Value>, usize)> {
        match self.completeness {
            Completeness::Complete => Ok((self.rows, self.requests)),
            Completeness::Partial(err) => Err(err),
        }
    }
}

// =============================================================================
// Load
// =============================================================================

/// Loads every row reachable through `fetch(offset, limit)`.
///
/// `on_progress` runs after each page. Its second argument carries the rows
/// so far each time another `progress_every` rows have arrived, and once more
/// when the load ends.
pub async fn load_all<F, Fut, P>(fetch: F, options: &LoaderOptions, mut on_progress: P) -> LoadReport
where
    F: Fn(usize, usize) -> Fut,
    Fut: Future<Output = SyncResult<Vec<Value>>>,
    P: FnMut(LoadProgress, Option<&[Value]>),
{
    let concurrent = options.concurrency > 1 && options.total.is_some();
    let report = if concurrent {
        load_concurrent(&fetch, options, &mut on_progress).await
    } else {
        load_sequential(&fetch, options, &mut on_progress).await
    };

    let phase = if report.is_complete() {
        LoadPhase::Complete
    } else {
        LoadPhase::Partial
    };
    on_progress(
        LoadProgress {
            current: report.rows.len(),
            total: options.total,
            phase,
        },
        Some(&report.rows),
    );

    debug!(
        rows = report.rows.len(),
        requests = report.requests,
        complete = report.is_complete(),
        "Load finished"
    );
    report
}

async fn fetch_window<F, Fut>(fetch: &F, offset: usize, limit: usize, deadline: Duration) -> SyncResult<Vec<Value>>
where
    F: Fn(usize, usize) -> Fut,
    Fut: Future<Output = SyncResult<Vec<Value>>>,
{
    match tokio::time::timeout(deadline, fetch(offset, limit)).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(format!(
            "page at offset {offset} after {}s",
            deadline.as_secs()
        ))),
    }
}

async fn load_sequential<F, Fut, P>(fetch: &F, options: &LoaderOptions, on_progress: &mut P) -> LoadReport
where
    F: Fn(usize, usize) -> Fut,
    Fut: Future<Output = SyncResult<Vec<Value>>>,
    P: FnMut(LoadProgress, Option<&[Value]>),
{
    let page_size = options.effective_page_size();
    let mut rows: Vec<Value> = Vec::new();
    let mut requests = 0;
    let mut next_handoff = options.progress_every.max(1);

    loop {
        let offset = rows.len();
        requests += 1;

        let page = match fetch_window(fetch, offset, page_size, options.request_timeout).await {
            Ok(page) => page,
            Err(err) => {
                warn!(offset, error = %err, "Page failed, load is partial");
                return LoadReport {
                    rows,
                    requests,
                    completeness: Completeness::Partial(err),
                };
            }
        };

        let received = page.len();
        rows.extend(page);

        let done = received < page_size || options.total.is_some_and(|t| rows.len() >= t);
        if !done {
            let handoff = rows.len() >= next_handoff;
            if handoff {
                next_handoff = rows.len() + options.progress_every.max(1);
            }
            on_progress(
                LoadProgress {
                    current: rows.len(),
                    total: options.total,
                    phase: LoadPhase::Fetching,
                },
                handoff.then_some(rows.as_slice()),
            );
            tokio::task::yield_now().await;
        } else {
            return LoadReport {
                rows,
                requests,
                completeness: Completeness::Complete,
            };
        }
    }
}

async fn load_concurrent<F, Fut, P>(fetch: &F, options: &LoaderOptions, on_progress: &mut P) -> LoadReport
where
    F: Fn(usize, usize) -> Fut,
    Fut: Future<Output = SyncResult<Vec<Value>>>,
    P: FnMut(LoadProgress, Option<&[Value]>),
{
    let page_size = options.effective_page_size();
    let total = options.total.unwrap_or_default();
    let offsets: Vec<usize> = (0..total).step_by(page_size).collect();
    let requests = offsets.len().max(1);

    if offsets.is_empty() {
        return LoadReport {
            rows: Vec::new(),
            requests: 0,
            completeness: Completeness::Complete,
        };
    }

    let mut pages = stream::iter(offsets)
        .map(|offset| async move {
            let result = fetch_window(fetch, offset, page_size, options.request_timeout).await;
            (offset, result)
        })
        .buffer_unordered(options.concurrency);

    let mut by_offset: BTreeMap<usize, Vec<Value>> = BTreeMap::new();
    let mut received = 0;
    let mut next_handoff = options.progress_every.max(1);
    let mut failure = None;

    while let Some((offset, result)) = pages.next().await {
        match result {
            Ok(page) => {
                received += page.len();
                by_offset.insert(offset, page);

                let handoff = received >= next_handoff;
                let so_far = handoff.then(|| flatten(&by_offset));
                if handoff {
                    next_handoff = received + options.progress_every.max(1);
                }
                on_progress(
                    LoadProgress {
                        current: received,
                        total: options.total,
                        phase: LoadPhase::Fetching,
                    },
                    so_far.as_deref(),
                );
            }
            Err(err) => {
                warn!(offset, error = %err, "Window failed, load is partial");
                failure = Some(err);
                break;
            }
        }
    }
    drop(pages);

    LoadReport {
        rows: flatten(&by_offset),
        requests,
        completeness: match failure {
            Some(err) => Completeness::Partial(err),
            None => Completeness::Complete,
        },
    }
}

fn flatten(pages: &BTreeMap<usize, Vec<Value>>) -> Vec<Value> {
    pages.values().flat_map(|page| page.iter().cloned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn dataset(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({ "id": format!("r{i:05}") })).collect()
    }

    #[tokio::test]
    async fn test_2500_rows_take_three_requests() {
        let data = dataset(2500);
        let windows = Mutex::new(Vec::new());

        let mut phases = Vec::new();
        let report = load_all(
            |offset, limit| {
                windows.lock().unwrap().push((offset, limit));
                let page = data.iter().skip(offset).take(limit).cloned().collect();
                async move { Ok(page) }
            },
            &LoaderOptions::default(),
            |progress, _| phases.push((progress.current, progress.phase)),
        )
        .await;

        assert!(report.is_complete());
        assert_eq!(report.rows.len(), 2500);
        assert_eq!(report.requests, 3);
        assert_eq!(
            *windows.lock().unwrap(),
            vec![(0, 1000), (1000, 1000), (2000, 1000)]
        );
        // Never complete before the 500-row page arrives.
        assert_eq!(
            phases,
            vec![
                (1000, LoadPhase::Fetching),
                (2000, LoadPhase::Fetching),
                (2500, LoadPhase::Complete)
            ]
        );
    }

    #[tokio::test]
    async fn test_page_size_is_clamped_to_cap() {
        let data = dataset(1500);
        let options = LoaderOptions {
            page_size: 10_000,
            ..Default::default()
        };

        let report = load_all(
            |offset, limit| {
                assert!(limit <= MAX_PAGE_SIZE);
                let page = data.iter().skip(offset).take(limit).cloned().collect();
                async move { Ok(page) }
            },
            &options,
            |_, _| {},
        )
        .await;

        assert_eq!(report.requests, 2);
        assert_eq!(report.rows.len(), 1500);
    }

    #[tokio::test]
    async fn test_known_total_stops_on_full_last_page() {
        let data = dataset(2000);
        let calls = AtomicUsize::new(0);
        let options = LoaderOptions::default().with_total(Some(2000));

        let report = load_all(
            |offset, limit| {
                calls.fetch_add(1, Ordering::SeqCst);
                let page = data.iter().skip(offset).take(limit).cloned().collect();
                async move { Ok(page) }
            },
            &options,
            |_, _| {},
        )
        .await;

        assert!(report.is_complete());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_page_returns_partial_rows() {
        let data = dataset(2500);

        let report = load_all(
            |offset, limit| {
                let result = if offset == 1000 {
                    Err(SyncError::Network("reset".into()))
                } else {
                    Ok(data.iter().skip(offset).take(limit).cloned().collect())
                };
                async move { result }
            },
            &LoaderOptions::default(),
            |_, _| {},
        )
        .await;

        assert!(!report.is_complete());
        assert_eq!(report.rows.len(), 1000);
        assert!(matches!(report.completeness, Completeness::Partial(SyncError::Network(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_page_times_out() {
        let options = LoaderOptions {
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        };

        let report = load_all(
            |_, _| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Vec::new())
            },
            &options,
            |_, _| {},
        )
        .await;

        assert!(matches!(report.completeness, Completeness::Partial(SyncError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_rows_handed_over_every_n() {
        let data = dataset(2500);
        let options = LoaderOptions {
            page_size: 500,
            progress_every: 1000,
            ..Default::default()
        };

        let mut handoffs = Vec::new();
        load_all(
            |offset, limit| {
                let page = data.iter().skip(offset).take(limit).cloned().collect();
                async move { Ok(page) }
            },
            &options,
            |_, rows| {
                if let Some(rows) = rows {
                    handoffs.push(rows.len());
                }
            },
        )
        .await;

        // 1000 and 2000 mid-load, then the final hand-off.
        assert_eq!(handoffs, vec![1000, 2000, 2500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_arrival_order_does_not_matter() {
        let data = dataset(3500);
        let options = LoaderOptions {
            concurrency: 4,
            ..Default::default()
        }
        .with_total(Some(3500));

        let report = load_all(
            |offset, limit| {
                let page: Vec<Value> = data.iter().skip(offset).take(limit).cloned().collect();
                // Later windows answer first.
                let delay = Duration::from_millis(400 - (offset / 1000) as u64 * 100);
                async move {
                    tokio::time::sleep(delay).await;
                    Ok(page)
                }
            },
            &options,
            |_, _| {},
        )
        .await;

        assert!(report.is_complete());
        assert_eq!(report.requests, 4);
        assert_eq!(report.rows, data);
    }
}
