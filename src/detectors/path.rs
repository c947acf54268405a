//! Cursor-path analysis
//!
//! Raw mouse samples are reduced with Douglas-Peucker simplification before
//! being considered for transmission size; path metrics (distance,
//! direction changes, velocity, erratic flag) are computed from the
//! un-simplified sequence for fidelity. Only the simplified point count
//! goes on the wire.

use chrono::{DateTime, Utc};

use crate::config::DetectorTunables;

/// One raw mouse position sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathPoint {
    pub x: f64,
    pub y: f64,
    pub at: DateTime<Utc>,
}

/// Aggregated metrics for one flushed sample window
#[derive(Debug, Clone, PartialEq)]
pub struct PathMetrics {
    pub sample_count: usize,
    /// Vertex count after Douglas-Peucker simplification
    pub simplified_points: usize,
    pub total_distance_px: f64,
    pub direction_changes: u32,
    pub avg_velocity_px_per_sec: f64,
    pub erratic: bool,
    pub duration_ms: i64,
}

/// Perpendicular distance from `point` to the segment `start`..`end`
fn perpendicular_distance(point: &PathPoint, start: &PathPoint, end: &PathPoint) -> f64 {
    let dx = end.x - start.x;
    let dy = end.y - start.y;
    let length = (dx * dx + dy * dy).sqrt();
    if length == 0.0 {
        return ((point.x - start.x).powi(2) + (point.y - start.y).powi(2)).sqrt();
    }
    ((dy * point.x - dx * point.y + end.x * start.y - end.y * start.x) / length).abs()
}

/// Douglas-Peucker simplification to perceptually significant vertices
pub fn simplify_path(points: &[PathPoint], epsilon_px: f64) -> Vec<PathPoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let first = points[0];
    let last = points[points.len() - 1];
    let mut max_distance = 0.0;
    let mut max_index = 0;
    for (i, point) in points.iter().enumerate().skip(1).take(points.len() - 2) {
        let distance = perpendicular_distance(point, &first, &last);
        if distance > max_distance {
            max_distance = distance;
            max_index = i;
        }
    }

    if max_distance <= epsilon_px {
        return vec![first, last];
    }

    let mut left = simplify_path(&points[..=max_index], epsilon_px);
    let right = simplify_path(&points[max_index..], epsilon_px);
    left.pop();
    left.extend(right);
    left
}

/// Compute path metrics from the raw (un-simplified) sample sequence
pub fn analyze_path(points: &[PathPoint], tunables: &DetectorTunables) -> PathMetrics {
    let simplified_points = simplify_path(points, tunables.path_epsilon_px).len();

    if points.len() < 2 {
        return PathMetrics {
            sample_count: points.len(),
            simplified_points,
            total_distance_px: 0.0,
            direction_changes: 0,
            avg_velocity_px_per_sec: 0.0,
            erratic: false,
            duration_ms: 0,
        };
    }

    let mut total_distance = 0.0;
    let mut direction_changes = 0u32;
    let mut previous_heading: Option<f64> = None;
    let turn_threshold = tunables.path_turn_threshold_deg.to_radians();

    for pair in points.windows(2) {
        let dx = pair[1].x - pair[0].x;
        let dy = pair[1].y - pair[0].y;
        let segment = (dx * dx + dy * dy).sqrt();
        if segment == 0.0 {
            continue;
        }
        total_distance += segment;

        let heading = dy.atan2(dx);
        if let Some(previous) = previous_heading {
            let mut turn = (heading - previous).abs();
            if turn > std::f64::consts::PI {
                turn = 2.0 * std::f64::consts::PI - turn;
            }
            if turn > turn_threshold {
                direction_changes += 1;
            }
        }
        previous_heading = Some(heading);
    }

    let duration_ms = (points[points.len() - 1].at - points[0].at).num_milliseconds();
    let avg_velocity = if duration_ms > 0 {
        total_distance / (duration_ms as f64 / 1_000.0)
    } else {
        0.0
    };

    let erratic = total_distance >= tunables.path_min_distance_px
        && (direction_changes as f64 / total_distance) > tunables.path_erratic_changes_per_px;

    PathMetrics {
        sample_count: points.len(),
        simplified_points,
        total_distance_px: total_distance,
        direction_changes,
        avg_velocity_px_per_sec: avg_velocity,
        erratic,
        duration_ms,
    }
}
