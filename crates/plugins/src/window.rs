//! Time-windowed scans over newest-first `[timestamp, value]` lists.
//!
//! The store holds pairs with the newest at index 0. A scan walks outward
//! in doubling windows (`[0,100)`, `[100,200)`, `[200,400)`, ...) until it
//! meets the first pair older than the limit or runs off the end of the
//! list, so a result of `N` points costs `O(log N)` round-trips.

use {
    pubrelay_protocol::INITIAL_SCAN_WINDOW,
    tracing::{debug, warn},
};

use crate::api::ListLookup;

/// `[unix_seconds, value]`.
pub type Point = [f64; 2];

/// Collect every pair with `timestamp >= limit`, newest first.
///
/// A lookup or decode failure ends the scan early; whatever was collected
/// up to that point is returned.
pub async fn collect_since(lookup: &dyn ListLookup, limit: i64) -> Vec<Point> {
    let mut points = Vec::new();
    let mut start = 0;
    let mut end = INITIAL_SCAN_WINDOW;

    loop {
        let batch = match lookup.lookup(start, end).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(start, end, error = %e, "list lookup failed, returning partial scan");
                return points;
            },
        };
        let exhausted = (batch.len() as i64) < end - start;

        for raw in &batch {
            let point: Point = match serde_json::from_str(raw) {
                Ok(p) => p,
                Err(e) => {
                    warn!(raw = %raw, error = %e, "undecodable list entry, returning partial scan");
                    return points;
                },
            };
            if (point[0] as i64) < limit {
                return points;
            }
            points.push(point);
        }

        if exhausted {
            debug!(collected = points.len(), "list exhausted");
            return points;
        }
        start = end;
        end *= 2;
    }
}

/// Thin a newest-first series so that kept points are at least `cad`
/// seconds apart. The first point is always kept.
pub fn decimate(points: &[Point], cad: i64) -> Vec<Point> {
    let mut kept = Vec::with_capacity(points.len());
    let mut last: Option<i64> = None;
    for point in points {
        let mark = point[0] as i64;
        if last.is_none_or(|last| last.saturating_sub(mark) >= cad) {
            kept.push(*point);
            last = Some(mark);
        }
    }
    kept
}
