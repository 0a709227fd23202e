//! Property tests for engagement counter parsing and batch ingestion

mod common;

use proptest::prelude::*;
use serde_json::{json, Value};

use scrapefleet::ingest::{parse_count, parse_count_str};

proptest! {
    #[test]
    fn plain_integers_parse_exactly(n in 0i64..=i64::MAX) {
        prop_assert_eq!(parse_count_str(&n.to_string()), n);
        prop_assert_eq!(parse_count(&json!(n)), n);
    }

    #[test]
    fn thousands_separators_are_ignored(n in 0u64..1_000_000_000_000) {
        let digits = n.to_string();
        let mut grouped = String::new();
        for (i, c) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(c);
        }
        prop_assert_eq!(parse_count_str(&grouped), n as i64);
    }

    #[test]
    fn suffixes_scale_whole_numbers(n in 0i64..1_000_000, upper in any::<bool>()) {
        let (k, m) = if upper { ("K", "M") } else { ("k", "m") };
        prop_assert_eq!(parse_count_str(&format!("{n}{k}")), n * 1_000);
        prop_assert_eq!(parse_count_str(&format!("{n}{m}")), n * 1_000_000);
    }

    #[test]
    fn one_decimal_place_with_suffix(whole in 0i64..10_000, tenth in 0i64..10) {
        prop_assert_eq!(
            parse_count_str(&format!("{whole}.{tenth}K")),
            whole * 1_000 + tenth * 100
        );
    }

    #[test]
    fn never_negative(s in ".{0,24}") {
        prop_assert!(parse_count_str(&s) >= 0);
        prop_assert!(parse_count(&Value::String(s)) >= 0);
    }

    #[test]
    fn negative_numbers_clamp_to_zero(n in i64::MIN..0) {
        prop_assert_eq!(parse_count(&json!(n)), 0);
        prop_assert_eq!(parse_count_str(&n.to_string()), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn ingest_keeps_exactly_the_valid_records(valid in 1u64..20, missing in 0usize..5) {
        let h = common::harness();
        let report = tokio_test::block_on(async {
            let task = common::pending_task(&h.store, "creator").await;
            h.state.pipeline.ingest(task.id, &common::batch(valid, missing)).await
        })
        .unwrap();

        prop_assert_eq!(report.result.total_videos, valid as i32);
        prop_assert_eq!(report.rejected.len(), missing);
        prop_assert!(report.result.videos.iter().all(|v| v.metrics.engagement_rate >= 0.0));
    }
}
