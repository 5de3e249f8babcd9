//! Turns whatever the user pasted into a URL the resolver can work with.
//!
//! Matching never fails: when nothing recognizable is found the trimmed input
//! is handed on unchanged and the resolver gets to report the problem.

use std::{fmt, str::FromStr, sync::LazyLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Video sites the front-end has a tab for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Bilibili,
    YouTube,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Bilibili, Platform::YouTube];

    pub fn name(self) -> &'static str {
        match self {
            Platform::Bilibili => "Bilibili",
            Platform::YouTube => "YouTube",
        }
    }

    fn other(self) -> Platform {
        match self {
            Platform::Bilibili => Platform::YouTube,
            Platform::YouTube => Platform::Bilibili,
        }
    }

    /// Canonical page URL for a bare video ID on this platform.
    pub fn video_url(self, id: &str) -> String {
        match self {
            Platform::Bilibili => format!("https://www.bilibili.com/video/{id}"),
            Platform::YouTube => format!("https://www.youtube.com/watch?v={id}"),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bilibili" | "bili" | "b" => Ok(Platform::Bilibili),
            "youtube" | "yt" | "y" => Ok(Platform::YouTube),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

static BILI_VIDEO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)https?://(?:www\.|m\.)?bilibili\.com/video/(BV[0-9A-Za-z]{10}|av\d+)/?(?:\?[^\s]*?\bp=(\d+))?",
    )
    .expect("bilibili video pattern is valid")
});

static BILI_BANGUMI_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:www\.|m\.)?bilibili\.com/bangumi/play/(?:ep|ss)\d+")
        .expect("bilibili bangumi pattern is valid")
});

static BILI_SHORT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://b23\.tv/[0-9A-Za-z]+").expect("b23 pattern is valid")
});

static BILI_BARE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(BV[0-9A-Za-z]{10}|av\d+)\b").expect("bilibili id pattern is valid")
});

static YT_WATCH_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)https?://(?:www\.|m\.|music\.)?youtube\.com/(?:watch\?(?:[^\s]*?&)?v=|shorts/|live/|embed/)([\w-]{11})",
    )
    .expect("youtube watch pattern is valid")
});

static YT_PLAYLIST_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:www\.|m\.|music\.)?youtube\.com/playlist\?(?:[^\s]*?&)?list=([\w-]+)")
        .expect("youtube playlist pattern is valid")
});

static YT_SHORT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://youtu\.be/([\w-]{11})").expect("youtu.be pattern is valid")
});

static YT_BARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w-]{11}$").expect("youtube id pattern is valid"));

/// Extracts a canonical URL from `raw` for the tab the text was pasted into.
///
/// Order: full page URL of `active`, short link of `active`, bare ID of
/// `active`, then any URL of the other platform.
pub fn normalize(raw: &str, active: Platform) -> String {
    let text = raw.trim();

    let found = full_url(text, active)
        .or_else(|| short_url(text, active))
        .or_else(|| bare_id(text, active))
        .or_else(|| full_url(text, active.other()))
        .or_else(|| short_url(text, active.other()));

    match found {
        Some(url) => url,
        None => text.to_owned(),
    }
}

/// Reports which platform a (normalized or raw) URL belongs to.
pub fn detect_platform(url: &str) -> Option<Platform> {
    let lower = url.to_ascii_lowercase();
    if lower.contains("bilibili.com") || lower.contains("b23.tv") {
        Some(Platform::Bilibili)
    } else if lower.contains("youtube.com") || lower.contains("youtu.be") {
        Some(Platform::YouTube)
    } else if BILI_BARE_ID.is_match(url) {
        Some(Platform::Bilibili)
    } else {
        None
    }
}

/// Pulls a Bilibili video ID (`BV…` or `av…`) out of a page URL.
pub fn bilibili_video_id(url: &str) -> Option<String> {
    BILI_BARE_ID
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}

fn full_url(text: &str, platform: Platform) -> Option<String> {
    match platform {
        Platform::Bilibili => {
            if let Some(caps) = BILI_VIDEO_URL.captures(text) {
                return Some(bilibili_canonical(&caps));
            }
            BILI_BANGUMI_URL.find(text).map(|m| m.as_str().to_owned())
        }
        Platform::YouTube => {
            if let Some(caps) = YT_PLAYLIST_URL.captures(text) {
                return Some(format!("https://www.youtube.com/playlist?list={}", &caps[1]));
            }
            YT_WATCH_URL
                .captures(text)
                .map(|caps| Platform::YouTube.video_url(&caps[1]))
        }
    }
}

fn short_url(text: &str, platform: Platform) -> Option<String> {
    match platform {
        Platform::Bilibili => BILI_SHORT_URL.find(text).map(|m| m.as_str().to_owned()),
        Platform::YouTube => YT_SHORT_URL
            .captures(text)
            .map(|caps| Platform::YouTube.video_url(&caps[1])),
    }
}

fn bare_id(text: &str, platform: Platform) -> Option<String> {
    match platform {
        Platform::Bilibili => BILI_BARE_ID
            .captures(text)
            .map(|caps| Platform::Bilibili.video_url(&caps[1])),
        // An 11-character word is too common to fish out of free text.
        Platform::YouTube => YT_BARE_ID
            .is_match(text)
            .then(|| Platform::YouTube.video_url(text)),
    }
}

fn bilibili_canonical(caps: &Captures<'_>) -> String {
    let base = Platform::Bilibili.video_url(&caps[1]);
    match caps.get(2) {
        Some(part) => format!("{base}?p={}", part.as_str()),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_bv_id_becomes_canonical_url() {
        assert_eq!(
            normalize("check this BV1xx411c7mD out", Platform::Bilibili),
            "https://www.bilibili.com/video/BV1xx411c7mD"
        );
    }

    #[test]
    fn bilibili_full_url_drops_tracking_query() {
        assert_eq!(
            normalize(
                "【标题】 https://www.bilibili.com/video/BV1GJ411x7h7/?spm_id_from=333.788&vd_source=abc",
                Platform::Bilibili
            ),
            "https://www.bilibili.com/video/BV1GJ411x7h7"
        );
    }

    #[test]
    fn bilibili_part_query_is_preserved() {
        assert_eq!(
            normalize(
                "https://m.bilibili.com/video/BV1GJ411x7h7?p=3&share=1",
                Platform::Bilibili
            ),
            "https://www.bilibili.com/video/BV1GJ411x7h7?p=3"
        );
    }

    #[test]
    fn bilibili_av_and_bangumi_urls() {
        assert_eq!(
            normalize("av170001", Platform::Bilibili),
            "https://www.bilibili.com/video/av170001"
        );
        assert_eq!(
            normalize("https://www.bilibili.com/bangumi/play/ep123456 看", Platform::Bilibili),
            "https://www.bilibili.com/bangumi/play/ep123456"
        );
    }

    #[test]
    fn bilibili_short_link_is_kept() {
        assert_eq!(
            normalize("【分享】 https://b23.tv/AbC123x 快来看", Platform::Bilibili),
            "https://b23.tv/AbC123x"
        );
    }

    #[test]
    fn youtube_watch_and_short_links() {
        assert_eq!(
            normalize(
                "https://www.youtube.com/watch?feature=share&v=dQw4w9WgXcQ&t=42",
                Platform::YouTube
            ),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(
            normalize("see https://youtu.be/dQw4w9WgXcQ?si=x", Platform::YouTube),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(
            normalize("https://youtube.com/shorts/abcdefghijk", Platform::YouTube),
            "https://www.youtube.com/watch?v=abcdefghijk"
        );
    }

    #[test]
    fn youtube_playlist_url_wins_over_watch() {
        assert_eq!(
            normalize(
                "https://www.youtube.com/playlist?list=PLbLC5kIdjT_EJEICsvJoWnvWHaGwosBBU",
                Platform::YouTube
            ),
            "https://www.youtube.com/playlist?list=PLbLC5kIdjT_EJEICsvJoWnvWHaGwosBBU"
        );
    }

    #[test]
    fn youtube_bare_id_only_when_whole_input() {
        assert_eq!(
            normalize("  dQw4w9WgXcQ ", Platform::YouTube),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(
            normalize("downloading", Platform::Bilibili),
            "downloading"
        );
        assert_eq!(
            normalize("see dQw4w9WgXcQ later", Platform::YouTube),
            "see dQw4w9WgXcQ later"
        );
    }

    #[test]
    fn cross_tab_paste_is_tolerated() {
        assert_eq!(
            normalize("https://youtu.be/dQw4w9WgXcQ", Platform::Bilibili),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(
            normalize("https://www.bilibili.com/video/BV1xx411c7mD", Platform::YouTube),
            "https://www.bilibili.com/video/BV1xx411c7mD"
        );
    }

    #[test]
    fn unmatched_text_is_returned_trimmed() {
        assert_eq!(normalize("  https://example.com/v/1  ", Platform::YouTube), "https://example.com/v/1");
        assert_eq!(normalize("", Platform::Bilibili), "");
    }

    #[test]
    fn detect_platform_by_host() {
        assert_eq!(detect_platform("https://b23.tv/x"), Some(Platform::Bilibili));
        assert_eq!(
            detect_platform("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Some(Platform::YouTube)
        );
        assert_eq!(detect_platform("https://example.com"), None);
    }

    #[test]
    fn known_host_wins_over_embedded_bilibili_id() {
        assert_eq!(
            detect_platform("https://www.youtube.com/watch?v=x-av1234-yz"),
            Some(Platform::YouTube)
        );
        assert_eq!(
            detect_platform("https://youtu.be/BV1xx411c7mD"),
            Some(Platform::YouTube)
        );
        assert_eq!(detect_platform("BV1xx411c7mD"), Some(Platform::Bilibili));
        assert_eq!(detect_platform("see av170001 here"), Some(Platform::Bilibili));
    }

    #[test]
    fn platform_parses_from_cli_names() {
        assert_eq!("YouTube".parse::<Platform>(), Ok(Platform::YouTube));
        assert_eq!("bili".parse::<Platform>(), Ok(Platform::Bilibili));
        assert!("vimeo".parse::<Platform>().is_err());
    }
}
