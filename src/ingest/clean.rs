//! Per-record cleaning
//!
//! Turns one loosely structured record into a [`CleanedRecord`] with typed
//! counters, trimmed text and bounded lists. Only a missing or unusable URL
//! rejects a record here; every other field degrades to a default.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;

use super::RejectReason;

pub const MAX_HASHTAGS: usize = 30;
pub const MAX_MENTIONS: usize = 20;
pub const MAX_COMMENT_SAMPLES: usize = 100;
pub const MAX_DESCRIPTION_CHARS: usize = 2000;
pub const MAX_COMMENT_CHARS: usize = 500;

const URL_KEYS: [&str; 3] = ["url", "video_url", "link"];
const DESCRIPTION_KEYS: [&str; 3] = ["description", "desc", "caption"];
const SHARE_KEYS: [&str; 3] = ["shares", "bookmarks", "share_count"];
const UPLOAD_DATE_KEYS: [&str; 3] = ["upload_date", "uploadDate", "create_time"];
const COMMENT_SAMPLE_KEYS: [&str; 3] = ["comment_texts", "top_comments", "comments_list"];

static VIDEO_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/video/(\d+)").expect("valid video id pattern"));

static HASHTAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([\w.]+)").expect("valid hashtag pattern"));

static MENTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([\w.]+)").expect("valid mention pattern"));

static RELATIVE_DATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s*([dwmy])\s*ago$").expect("valid relative date pattern")
});

static MONTH_DAY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})-(\d{1,2})$").expect("valid month-day pattern"));

/// A record after cleaning, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedRecord {
    pub video_id: String,
    pub url: String,
    pub description: String,
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub duration: Option<String>,
    pub upload_date: Option<DateTime<Utc>>,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub comment_texts: Vec<String>,
}

/// Clean one raw record
pub fn clean_record(raw: &Value, now: DateTime<Utc>) -> Result<CleanedRecord, RejectReason> {
    let Value::Object(map) = raw else {
        return Err(RejectReason::NotAnObject);
    };
    let field = |keys: &[&str]| first_present(map, keys);

    let url = field(&URL_KEYS[..])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(RejectReason::MissingUrl)?;
    let parsed = url::Url::parse(url).map_err(|_| RejectReason::InvalidUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(RejectReason::InvalidUrl);
    }

    let mut description = field(&DESCRIPTION_KEYS[..])
        .map(text_of)
        .unwrap_or_default();
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        description = description.chars().take(MAX_DESCRIPTION_CHARS).collect();
    }

    let hashtags = match map.get("hashtags").filter(|v| !v.is_null()) {
        Some(v) => normalize_list(v, '#'),
        None => derive_tags(&HASHTAG_REGEX, &description),
    };
    let mentions = match map.get("mentions").filter(|v| !v.is_null()) {
        Some(v) => normalize_list(v, '@'),
        None => derive_tags(&MENTION_REGEX, &description),
    };
    let comment_texts = field(&COMMENT_SAMPLE_KEYS[..])
        .map(|v| normalize_list(v, '\0'))
        .unwrap_or_default();

    Ok(CleanedRecord {
        video_id: video_id_of(url, map.get("video_id")),
        url: url.to_string(),
        views: map.get("views").map_or(0, parse_count),
        likes: map.get("likes").map_or(0, parse_count),
        comments: map.get("comments").map_or(0, parse_count),
        shares: field(&SHARE_KEYS[..]).map_or(0, parse_count),
        duration: map
            .get("duration")
            .map(text_of)
            .filter(|d| !d.is_empty()),
        upload_date: field(&UPLOAD_DATE_KEYS[..]).and_then(|v| parse_upload_date(v, now)),
        hashtags: cap(hashtags, MAX_HASHTAGS, usize::MAX),
        mentions: cap(mentions, MAX_MENTIONS, usize::MAX),
        comment_texts: cap(comment_texts, MAX_COMMENT_SAMPLES, MAX_COMMENT_CHARS),
        description,
    })
}

fn first_present<'a>(map: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| map.get(*k).filter(|v| !v.is_null()))
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numeric id from `/video/<digits>`, then an explicit field, then the
/// last path segment
fn video_id_of(url: &str, explicit: Option<&Value>) -> String {
    if let Some(caps) = VIDEO_ID_REGEX.captures(url) {
        return caps[1].to_string();
    }
    if let Some(id) = explicit.map(text_of).filter(|s| !s.is_empty()) {
        return id;
    }
    url.split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

// ============================================================================
// Counters
// ============================================================================

/// Parse an engagement counter.
///
/// Accepts numbers and strings with thousands separators and an optional
/// `k`/`m`/`b` suffix. Unparseable input yields 0; negatives clamp to 0.
pub fn parse_count(value: &Value) -> i64 {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.max(0)
            } else if let Some(u) = n.as_u64() {
                i64::try_from(u).unwrap_or(i64::MAX)
            } else {
                n.as_f64().map_or(0, |f| {
                    if f.is_finite() && f > 0.0 {
                        f.floor().min(i64::MAX as f64) as i64
                    } else {
                        0
                    }
                })
            }
        }
        Value::String(s) => parse_count_str(s),
        _ => 0,
    }
}

/// String form of [`parse_count`], using exact decimal arithmetic
pub fn parse_count_str(input: &str) -> i64 {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    let (number, multiplier): (&str, u128) = match cleaned.chars().last() {
        Some('k') => (&cleaned[..cleaned.len() - 1], 1_000),
        Some('m') => (&cleaned[..cleaned.len() - 1], 1_000_000),
        Some('b') => (&cleaned[..cleaned.len() - 1], 1_000_000_000),
        _ => (cleaned.as_str(), 1),
    };

    let (negative, digits) = match number.as_bytes().first() {
        Some(b'-') => (true, &number[1..]),
        Some(b'+') => (false, &number[1..]),
        _ => (false, number),
    };

    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction) {
        return 0;
    }
    if negative {
        return 0;
    }

    let whole_value: u128 = if whole.is_empty() {
        0
    } else {
        match whole.parse() {
            Ok(v) => v,
            // more digits than u128 holds
            Err(_) => return i64::MAX,
        }
    };

    let fraction = &fraction[..fraction.len().min(18)];
    let fraction_value = if fraction.is_empty() {
        0
    } else {
        let scale = 10u128.pow(fraction.len() as u32);
        fraction.parse::<u128>().unwrap_or(0) * multiplier / scale
    };

    whole_value
        .checked_mul(multiplier)
        .and_then(|w| w.checked_add(fraction_value))
        .map_or(i64::MAX, |total| i64::try_from(total).unwrap_or(i64::MAX))
}

// ============================================================================
// Lists
// ============================================================================

/// Accept a native list, a JSON-encoded list, or a plain string
pub fn normalize_list(value: &Value, strip_prefix: char) -> Vec<String> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            _ => vec![Value::String(s.clone())],
        },
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };

    items
        .iter()
        .map(|item| {
            let text = text_of(item);
            text.trim_start_matches(strip_prefix).trim().to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn derive_tags(pattern: &Regex, description: &str) -> Vec<String> {
    pattern
        .captures_iter(description)
        .map(|c| c[1].trim_end_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Drop items longer than `max_chars`, then keep at most `max_items`
fn cap(items: Vec<String>, max_items: usize, max_chars: usize) -> Vec<String> {
    items
        .into_iter()
        .filter(|s| s.chars().count() <= max_chars)
        .take(max_items)
        .collect()
}

// ============================================================================
// Dates
// ============================================================================

/// Parse an upload date in any of the forms the scraper emits
pub fn parse_upload_date(value: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Value::String(s) => parse_upload_date_str(s, now),
        _ => None,
    }
}

fn parse_upload_date_str(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }

    if let Some(caps) = RELATIVE_DATE_REGEX.captures(&s) {
        let n: i64 = caps[1].parse().ok()?;
        let days = match &caps[2] {
            "d" => n,
            "w" => n.checked_mul(7)?,
            "m" => n.checked_mul(30)?,
            "y" => n.checked_mul(365)?,
            _ => return None,
        };
        return now.checked_sub_signed(Duration::try_days(days)?);
    }

    if let Some(caps) = MONTH_DAY_REGEX.captures(&s) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let this_year = midnight(NaiveDate::from_ymd_opt(now.year(), month, day)?);
        return if this_year > now {
            NaiveDate::from_ymd_opt(now.year() - 1, month, day).map(midnight)
        } else {
            Some(this_year)
        };
    }

    if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Some(midnight(date));
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(input.trim()) {
        return Some(ts.with_timezone(&Utc));
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    }

    None
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_count_suffixes() {
        assert_eq!(parse_count_str("142.5K"), 142_500);
        assert_eq!(parse_count_str("1.6M"), 1_600_000);
        assert_eq!(parse_count_str("890"), 890);
        assert_eq!(parse_count_str("2b"), 2_000_000_000);
        assert_eq!(parse_count_str("1,234,567"), 1_234_567);
        assert_eq!(parse_count_str("1.23456k"), 1_234);
        assert_eq!(parse_count_str(".5k"), 500);
    }

    #[test]
    fn test_parse_count_garbage_and_negatives() {
        assert_eq!(parse_count_str("abc"), 0);
        assert_eq!(parse_count_str(""), 0);
        assert_eq!(parse_count_str("k"), 0);
        assert_eq!(parse_count_str("-5"), 0);
        assert_eq!(parse_count_str("-1.2K"), 0);
        assert_eq!(parse_count(&json!(-3)), 0);
        assert_eq!(parse_count(&json!(12.9)), 12);
        assert_eq!(parse_count(&json!(null)), 0);
        assert_eq!(parse_count(&json!(true)), 0);
    }

    #[test]
    fn test_normalize_list_forms() {
        assert_eq!(normalize_list(&json!(["#a", " b "]), '#'), vec!["a", "b"]);
        assert_eq!(normalize_list(&json!(r#"["x", "y"]"#), '#'), vec!["x", "y"]);
        assert_eq!(normalize_list(&json!("just text"), '\0'), vec!["just text"]);
        assert!(normalize_list(&json!(""), '#').is_empty());
    }

    #[test]
    fn test_clean_rejects_bad_urls() {
        assert_eq!(
            clean_record(&json!({"views": 3}), now()),
            Err(RejectReason::MissingUrl)
        );
        assert_eq!(
            clean_record(&json!({"url": "not a link"}), now()),
            Err(RejectReason::InvalidUrl)
        );
        assert_eq!(
            clean_record(&json!({"url": "ftp://tiktok.com/x"}), now()),
            Err(RejectReason::InvalidUrl)
        );
        assert_eq!(clean_record(&json!("x"), now()), Err(RejectReason::NotAnObject));
    }

    #[test]
    fn test_clean_full_record() {
        let raw = json!({
            "video_url": "https://www.tiktok.com/@cook/video/7301",
            "description": "  easy pasta #food #fyp with @chef  ",
            "views": "1.2M",
            "likes": "45.1K",
            "comments": 320,
            "bookmarks": "1,204",
            "upload_date": "3d ago",
            "top_comments": ["yum", "x".repeat(600)]
        });
        let record = clean_record(&raw, now()).unwrap();

        assert_eq!(record.video_id, "7301");
        assert_eq!(record.description, "easy pasta #food #fyp with @chef");
        assert_eq!(record.views, 1_200_000);
        assert_eq!(record.likes, 45_100);
        assert_eq!(record.comments, 320);
        assert_eq!(record.shares, 1_204);
        assert_eq!(record.hashtags, vec!["food", "fyp"]);
        assert_eq!(record.mentions, vec!["chef"]);
        assert_eq!(record.comment_texts, vec!["yum"]);
        assert_eq!(record.upload_date, Some(now() - Duration::days(3)));
    }

    #[test]
    fn test_list_caps() {
        let tags: Vec<String> = (0..40).map(|i| format!("t{i}")).collect();
        let raw = json!({
            "url": "https://www.tiktok.com/@a/video/1",
            "hashtags": tags,
            "description": "d".repeat(2500)
        });
        let record = clean_record(&raw, now()).unwrap();
        assert_eq!(record.hashtags.len(), MAX_HASHTAGS);
        assert_eq!(record.description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn test_upload_date_forms() {
        let n = now();
        assert_eq!(parse_upload_date(&json!("2w ago"), n), Some(n - Duration::days(14)));
        assert_eq!(parse_upload_date(&json!("1m ago"), n), Some(n - Duration::days(30)));
        assert_eq!(parse_upload_date(&json!("1y ago"), n), Some(n - Duration::days(365)));
        assert_eq!(
            parse_upload_date(&json!("4-25"), n),
            Some(Utc.with_ymd_and_hms(2024, 4, 25, 0, 0, 0).unwrap())
        );
        // future month-day rolls back a year
        assert_eq!(
            parse_upload_date(&json!("12-23"), n),
            Some(Utc.with_ymd_and_hms(2023, 12, 23, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_upload_date(&json!("2024-01-05"), n),
            Some(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap())
        );
        assert_eq!(
            parse_upload_date(&json!(1_700_000_000), n),
            Utc.timestamp_opt(1_700_000_000, 0).single()
        );
        assert_eq!(parse_upload_date(&json!("2-30"), n), None);
        assert_eq!(parse_upload_date(&json!("yesterday"), n), None);
    }

    #[test]
    fn test_video_id_fallbacks() {
        assert_eq!(video_id_of("https://vm.tiktok.com/ZMabc/", None), "ZMabc");
        assert_eq!(
            video_id_of("https://vm.tiktok.com/ZMabc", Some(&json!(99))),
            "99"
        );
    }
}
