//! Keyword-based content categories
//!
//! Each category is an independent flag: a record may match several or none.

use crate::models::ContentCategories;

pub const MUSIC_KEYWORDS: &[&str] = &[
    "music", "song", "remix", "beat", "cover", "singing", "dj", "lyrics", "sound",
];

pub const DANCE_KEYWORDS: &[&str] = &["dance", "dancing", "choreo", "choreography", "dancechallenge"];

pub const COMEDY_KEYWORDS: &[&str] = &["funny", "comedy", "lol", "joke", "prank", "humor", "meme"];

pub const EDUCATIONAL_KEYWORDS: &[&str] = &[
    "learn", "tutorial", "howto", "how to", "education", "tips", "facts", "explained", "lesson",
];

pub const TRENDING_HASHTAGS: &[&str] = &["fyp", "foryou", "foryoupage", "viral", "trending", "xyzbca"];

/// Keywords match whole words; "how to" matches as a phrase
fn any_present(words: &[&str], keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| {
        let phrase: Vec<&str> = keyword.split_whitespace().collect();
        words.windows(phrase.len()).any(|w| w == phrase.as_slice())
    })
}

/// Categorize from the description and hashtag list
pub fn categorize(description: &str, hashtags: &[String]) -> ContentCategories {
    let mut text = description.to_lowercase();
    for tag in hashtags {
        text.push(' ');
        text.push_str(&tag.to_lowercase());
    }
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    ContentCategories {
        has_music: any_present(&words, MUSIC_KEYWORDS),
        has_dance: any_present(&words, DANCE_KEYWORDS),
        has_comedy: any_present(&words, COMEDY_KEYWORDS),
        has_educational: any_present(&words, EDUCATIONAL_KEYWORDS),
        has_trending_hashtags: any_present(&words, TRENDING_HASHTAGS),
    }
}
