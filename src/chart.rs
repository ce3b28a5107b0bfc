//! Time-bucketed aggregation over tracked events
//!
//! A chart divides a time window into fixed-width buckets and counts
//! events per bucket. Buckets are half-open `[start, start + step)`, so
//! an event at a seam is counted exactly once. The window itself can be
//! given several ways; [`resolve_window`] ranks the supported
//! combinations and rejects the rest.

use crate::error::{Error, Result};
use crate::query::QueryEngine;
use crate::types::{ChartBucket, ContextPath, Timestamp};

/// Hard ceiling on buckets per chart, guarding against window/step
/// combinations that would swamp the store with range counts
const MAX_CHART_BUCKETS: usize = 100_000;

/// Options for a `chart` call
///
/// Supported window forms, in priority order:
///
/// 1. `time_start` + `time_end` + `step`
/// 2. `time_start` + `time_end` + `data_points` (step derived)
/// 3. one bound + `step` + `data_points` (walks away from the bound)
/// 4. `data_points` alone (bounds detected from stored events)
///
/// # Example
///
/// ```rust
/// use tally::ChartOptions;
///
/// let opts = ChartOptions::new()
///     .with_time_start(1_700_000_000.0)
///     .with_time_end(1_700_003_600.0)
///     .with_step(60.0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ChartOptions {
    /// Context path under the metric; the metric root when empty
    pub context: ContextPath,

    /// Window start (inclusive)
    pub time_start: Option<Timestamp>,

    /// Window end (exclusive for bucket admission)
    pub time_end: Option<Timestamp>,

    /// Bucket width in seconds
    pub step: Option<f64>,

    /// Number of buckets to produce
    pub data_points: Option<usize>,
}

impl ChartOptions {
    /// Empty options; a window form must be supplied before charting
    pub fn new() -> Self {
        Self::default()
    }

    /// Chart under a context path instead of the metric root
    pub fn with_context(mut self, context: impl Into<ContextPath>) -> Self {
        self.context = context.into();
        self
    }

    /// Set the window start
    pub fn with_time_start(mut self, time_start: Timestamp) -> Self {
        self.time_start = Some(time_start);
        self
    }

    /// Set the window end
    pub fn with_time_end(mut self, time_end: Timestamp) -> Self {
        self.time_end = Some(time_end);
        self
    }

    /// Set the bucket width in seconds
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    /// Set the number of buckets
    pub fn with_data_points(mut self, data_points: usize) -> Self {
        self.data_points = Some(data_points);
        self
    }
}

/// A resolved window: either concrete bucket starts, or a request to
/// detect bounds from the stored events first
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum WindowPlan {
    /// Bucket starts are fully determined by the options
    Fixed {
        /// Ascending bucket start times
        starts: Vec<Timestamp>,
        /// Bucket width in seconds
        width: f64,
    },
    /// Bounds come from the earliest/latest stored event
    AutoDetect {
        /// Number of buckets to spread across the detected span
        data_points: usize,
    },
}

/// Produces per-bucket event counts over a resolved window
#[derive(Clone)]
pub struct Aggregator {
    query: QueryEngine,
}

impl Aggregator {
    /// Create an aggregator on top of the query engine
    pub fn new(query: QueryEngine) -> Self {
        Self { query }
    }

    /// Count events per time bucket for a metric
    ///
    /// Buckets come back in ascending start order, one count per
    /// bucket, zeros included. Counts sum across every key under the
    /// resolved context, and each bucket is the half-open window
    /// `[start, start + step)`.
    pub async fn chart(&self, metric: &str, opts: ChartOptions) -> Result<Vec<ChartBucket>> {
        let keys = self.query.resolve_keys(metric, &opts.context).await?;

        let plan = resolve_window(opts.time_start, opts.time_end, opts.step, opts.data_points)?;
        let (starts, width) = match plan {
            WindowPlan::Fixed { starts, width } => (starts, width),
            WindowPlan::AutoDetect { data_points } => {
                match self.query.score_extent(&keys).await? {
                    Some((min, max)) => buckets_for_span(min, max, data_points)?,
                    None => return Ok(Vec::new()),
                }
            },
        };

        let counts = self.query.bucket_counts(&keys, &starts, width).await?;
        Ok(starts
            .into_iter()
            .zip(counts)
            .map(|(start, count)| ChartBucket { start, count })
            .collect())
    }
}

/// Rank the window options against the supported forms
///
/// A present `step` must be a finite positive number regardless of which
/// form ends up matching, so `step = 0` with `data_points = 2` fails as
/// an invalid step rather than sliding into form 3.
pub(crate) fn resolve_window(
    time_start: Option<Timestamp>,
    time_end: Option<Timestamp>,
    step: Option<f64>,
    data_points: Option<usize>,
) -> Result<WindowPlan> {
    if let Some(step) = step {
        if !step.is_finite() || step <= 0.0 {
            return Err(Error::InvalidStep(step));
        }
    }
    if let Some(points) = data_points {
        if points == 0 {
            return Err(Error::InvalidOptions(
                "data_points must be at least 1".to_string(),
            ));
        }
        if points > MAX_CHART_BUCKETS {
            return Err(Error::InvalidOptions(format!(
                "window would produce more than {} buckets",
                MAX_CHART_BUCKETS
            )));
        }
    }
    for bound in [time_start, time_end].into_iter().flatten() {
        if !bound.is_finite() {
            return Err(Error::InvalidOptions(
                "time bounds must be finite".to_string(),
            ));
        }
    }

    match (time_start, time_end, step, data_points) {
        (Some(start), Some(end), Some(step), _) => Ok(WindowPlan::Fixed {
            starts: slide_buckets(start, end, step)?,
            width: step,
        }),
        (Some(start), Some(end), None, Some(points)) => {
            let (starts, width) = buckets_for_span(start, end, points)?;
            Ok(WindowPlan::Fixed { starts, width })
        },
        (Some(start), None, Some(step), Some(points)) => Ok(WindowPlan::Fixed {
            starts: (0..points).map(|i| start + i as f64 * step).collect(),
            width: step,
        }),
        (None, Some(end), Some(step), Some(points)) => Ok(WindowPlan::Fixed {
            starts: (1..=points).rev().map(|i| end - i as f64 * step).collect(),
            width: step,
        }),
        (None, None, None, Some(points)) => Ok(WindowPlan::AutoDetect {
            data_points: points,
        }),
        _ => Err(Error::InvalidOptions(
            "supported windows: both bounds with step or data_points, \
             one bound with step and data_points, or data_points alone"
                .to_string(),
        )),
    }
}

/// Bucket starts from `start` while strictly below `end`
///
/// The last admitted bucket may extend past `end`; an event exactly at
/// `end` is outside the chart.
fn slide_buckets(start: Timestamp, end: Timestamp, width: f64) -> Result<Vec<Timestamp>> {
    let mut starts = Vec::new();
    let mut i = 0usize;

    loop {
        // Indexed rather than accumulated to keep starts exact over
        // long windows
        let bucket = start + i as f64 * width;
        if bucket >= end {
            break;
        }
        if starts.len() >= MAX_CHART_BUCKETS {
            return Err(Error::InvalidOptions(format!(
                "window would produce more than {} buckets",
                MAX_CHART_BUCKETS
            )));
        }
        starts.push(bucket);
        i += 1;
    }

    Ok(starts)
}

/// Spread `data_points` buckets across `[start, end)` with a derived
/// whole-second width
fn buckets_for_span(
    start: Timestamp,
    end: Timestamp,
    data_points: usize,
) -> Result<(Vec<Timestamp>, f64)> {
    let width = ((end - start) / data_points as f64).ceil();
    let starts = slide_buckets(start, end, width)?;
    Ok((starts, width))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Fixed Window Tests =====

    #[test]
    fn test_both_bounds_with_step() {
        let plan = resolve_window(Some(100.0), Some(103.0), Some(1.0), None).unwrap();

        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![100.0, 101.0, 102.0],
                width: 1.0,
            }
        );
    }

    #[test]
    fn test_last_bucket_may_extend_past_end() {
        let plan = resolve_window(Some(100.0), Some(105.0), Some(2.0), None).unwrap();

        // 104 is admitted (104 < 105) even though its bucket reaches 106
        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![100.0, 102.0, 104.0],
                width: 2.0,
            }
        );
    }

    #[test]
    fn test_step_wins_over_data_points() {
        // Both bounds and step: data_points is ignored, not an error
        let plan = resolve_window(Some(0.0), Some(4.0), Some(2.0), Some(17)).unwrap();

        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![0.0, 2.0],
                width: 2.0,
            }
        );
    }

    #[test]
    fn test_equal_bounds_make_empty_chart() {
        let plan = resolve_window(Some(100.0), Some(100.0), Some(5.0), None).unwrap();

        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![],
                width: 5.0,
            }
        );
    }

    // ===== Derived Step Tests =====

    #[test]
    fn test_data_points_derive_step() {
        let plan = resolve_window(Some(100.0), Some(300.0), None, Some(2)).unwrap();

        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![100.0, 200.0],
                width: 100.0,
            }
        );
    }

    #[test]
    fn test_derived_step_rounds_up() {
        // ceil(10 / 3) = 4, so three buckets cover the span unevenly
        let plan = resolve_window(Some(0.0), Some(10.0), None, Some(3)).unwrap();

        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![0.0, 4.0, 8.0],
                width: 4.0,
            }
        );
    }

    #[test]
    fn test_equal_bounds_with_data_points() {
        let plan = resolve_window(Some(100.0), Some(100.0), None, Some(4)).unwrap();

        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![],
                width: 0.0,
            }
        );
    }

    // ===== Anchored Window Tests =====

    #[test]
    fn test_start_anchor_walks_forward() {
        let plan = resolve_window(Some(100.0), None, Some(10.0), Some(3)).unwrap();

        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![100.0, 110.0, 120.0],
                width: 10.0,
            }
        );
    }

    #[test]
    fn test_end_anchor_walks_backward_but_reports_ascending() {
        let plan = resolve_window(None, Some(100.0), Some(10.0), Some(3)).unwrap();

        // The last bucket [90, 100) abuts the anchor
        assert_eq!(
            plan,
            WindowPlan::Fixed {
                starts: vec![70.0, 80.0, 90.0],
                width: 10.0,
            }
        );
    }

    // ===== Auto-Detect Tests =====

    #[test]
    fn test_data_points_alone_auto_detects() {
        let plan = resolve_window(None, None, None, Some(5)).unwrap();

        assert_eq!(plan, WindowPlan::AutoDetect { data_points: 5 });
    }

    // ===== Rejection Tests =====

    #[test]
    fn test_zero_step_rejected_before_case_matching() {
        // Would otherwise match the anchored form
        let err = resolve_window(None, Some(100.0), Some(0.0), Some(2)).unwrap_err();

        assert!(matches!(err, Error::InvalidStep(step) if step == 0.0));
    }

    #[test]
    fn test_negative_and_nan_steps_rejected() {
        let err = resolve_window(Some(0.0), Some(10.0), Some(-1.0), None).unwrap_err();
        assert!(matches!(err, Error::InvalidStep(step) if step == -1.0));

        let err = resolve_window(Some(0.0), Some(10.0), Some(f64::NAN), None).unwrap_err();
        assert!(matches!(err, Error::InvalidStep(step) if step.is_nan()));
    }

    #[test]
    fn test_zero_data_points_rejected() {
        let err = resolve_window(Some(0.0), Some(10.0), None, Some(0)).unwrap_err();

        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_unsupported_combinations_rejected() {
        // Nothing at all
        let err = resolve_window(None, None, None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));

        // One bound with step but no data_points
        let err = resolve_window(None, Some(100.0), Some(10.0), None).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));

        // Step and data_points with no bound to anchor them
        let err = resolve_window(None, None, Some(10.0), Some(3)).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));

        // Bounds alone
        let err = resolve_window(Some(0.0), Some(10.0), None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_non_finite_bounds_rejected() {
        let err =
            resolve_window(Some(f64::NEG_INFINITY), Some(10.0), Some(1.0), None).unwrap_err();

        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_bucket_cap_enforced() {
        let err = resolve_window(Some(0.0), Some(200_000.0), Some(1.0), None).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));

        let err = resolve_window(Some(0.0), None, Some(1.0), Some(200_000)).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    // ===== Options Tests =====

    #[test]
    fn test_chart_options_builder() {
        let opts = ChartOptions::new()
            .with_context("home")
            .with_time_start(100.0)
            .with_time_end(200.0)
            .with_step(10.0)
            .with_data_points(10);

        assert_eq!(opts.context.segments(), ["home"]);
        assert_eq!(opts.time_start, Some(100.0));
        assert_eq!(opts.time_end, Some(200.0));
        assert_eq!(opts.step, Some(10.0));
        assert_eq!(opts.data_points, Some(10));
    }
}
