use serde::{Deserialize, Serialize};

/// A point in normalized [0,1]x[0,1] image space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormPoint {
    pub x: f64,
    pub y: f64,
}

impl NormPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Euclidean distance between two normalized points.
pub fn distance(a: NormPoint, b: NormPoint) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

/// Clamp a value into [0,1].
pub fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Safe ratio; returns 0.0 when the denominator is degenerate.
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() < f64::EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

/// Map `value` linearly from the span [start, end] into [0,1], clamped.
///
/// `start` maps to 0 and `end` maps to 1. The span may be inverted
/// (start > end), which is how distance ratios turn into proximity scores:
/// smaller distance, higher score.
pub fn map_range(value: f64, start: f64, end: f64) -> f64 {
    let span = end - start;
    if span.abs() < f64::EPSILON {
        return if value >= end { 1.0 } else { 0.0 };
    }
    clamp01((value - start) / span)
}

/// Minimum pairwise distance between two point sets.
///
/// None when either set is empty, which callers treat as "signal absent"
/// rather than zero proximity.
pub fn min_pairwise_distance(points: &[NormPoint], targets: &[NormPoint]) -> Option<f64> {
    if points.is_empty() || targets.is_empty() {
        return None;
    }

    let mut min = f64::MAX;
    for p in points {
        for t in targets {
            let d = distance(*p, *t);
            if d < min {
                min = d;
            }
        }
    }
    Some(min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = NormPoint::new(0.0, 0.0);
        let b = NormPoint::new(0.3, 0.4);
        assert!((distance(a, b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_clamp01() {
        assert_eq!(clamp01(-0.5), 0.0);
        assert_eq!(clamp01(0.25), 0.25);
        assert_eq!(clamp01(1.5), 1.0);
    }

    #[test]
    fn test_ratio_degenerate_denominator() {
        assert_eq!(ratio(1.0, 0.0), 0.0);
        assert!((ratio(1.0, 2.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_map_range_forward() {
        assert_eq!(map_range(0.0, 0.0, 1.0), 0.0);
        assert_eq!(map_range(0.5, 0.0, 1.0), 0.5);
        assert_eq!(map_range(2.0, 0.0, 1.0), 1.0);
    }

    #[test]
    fn test_map_range_inverted() {
        // Distance 0.42 of face width is the far edge, 0.15 is touching.
        assert_eq!(map_range(0.42, 0.42, 0.15), 0.0);
        assert_eq!(map_range(0.15, 0.42, 0.15), 1.0);
        assert!(map_range(0.30, 0.42, 0.15) > 0.0);
        assert!(map_range(0.30, 0.42, 0.15) < 1.0);
    }

    #[test]
    fn test_min_pairwise_distance_empty() {
        let points = [NormPoint::new(0.1, 0.1)];
        assert!(min_pairwise_distance(&points, &[]).is_none());
        assert!(min_pairwise_distance(&[], &points).is_none());
    }

    #[test]
    fn test_min_pairwise_distance_picks_closest() {
        let hands = [NormPoint::new(0.0, 0.0), NormPoint::new(0.5, 0.5)];
        let cheeks = [NormPoint::new(0.5, 0.6), NormPoint::new(0.9, 0.9)];
        let min = min_pairwise_distance(&hands, &cheeks).unwrap();
        assert!((min - 0.1).abs() < 1e-9);
    }
}
