//! Engagement metrics

use crate::models::EngagementMetrics;

/// Upper bound for `engagement_rate`
pub const MAX_ENGAGEMENT_RATE: f64 = 100.0;

/// Per-view ratios with a divisor of at least 1, so zero-view records keep
/// finite metrics
pub fn compute_metrics(views: i64, likes: i64, comments: i64, bookmarks: i64) -> EngagementMetrics {
    let divisor = views.max(1) as f64;
    let interactions = (likes.max(0) + comments.max(0) + bookmarks.max(0)) as f64;

    EngagementMetrics {
        engagement_rate: (interactions / divisor * 100.0).min(MAX_ENGAGEMENT_RATE),
        likes_per_view: likes.max(0) as f64 / divisor,
        comments_per_view: comments.max(0) as f64 / divisor,
        bookmarks_per_view: bookmarks.max(0) as f64 / divisor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_views_use_unit_divisor() {
        let m = compute_metrics(0, 5, 0, 0);
        assert_eq!(m.engagement_rate, 100.0);
        assert_eq!(m.likes_per_view, 5.0);
    }

    #[test]
    fn test_regular_ratios() {
        let m = compute_metrics(1000, 50, 30, 20);
        assert!((m.engagement_rate - 10.0).abs() < 1e-9);
        assert!((m.likes_per_view - 0.05).abs() < 1e-9);
        assert!((m.comments_per_view - 0.03).abs() < 1e-9);
        assert!((m.bookmarks_per_view - 0.02).abs() < 1e-9);
    }
}
