//! Format shortlist shown to the user.
//!
//! yt-dlp reports every encoding a site offers, often a dozen per resolution.
//! [`rank`] reduces that to one entry per resolution plus the best audio-only
//! stream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::text::format_bytes;

/// One entry of the `formats` array in yt-dlp's JSON. Everything is optional
/// because sites fill in wildly different subsets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    pub abr: Option<f64>,
    pub tbr: Option<f64>,
    pub asr: Option<f64>,
    pub format_note: Option<String>,
}

impl RawFormat {
    fn has_video(&self) -> bool {
        match self.vcodec.as_deref() {
            Some(codec) => !codec.eq_ignore_ascii_case("none"),
            // Some extractors leave vcodec unset for muxed streams but still
            // report a frame size.
            None => self.height.unwrap_or(0) > 0,
        }
    }

    fn has_audio(&self) -> bool {
        self.acodec
            .as_deref()
            .is_some_and(|codec| !codec.eq_ignore_ascii_case("none"))
    }

    fn audio_bitrate(&self) -> f64 {
        self.abr.or(self.tbr).or(self.asr).unwrap_or(0.0)
    }

    fn size(&self) -> u64 {
        self.filesize.or(self.filesize_approx).unwrap_or(0)
    }

    fn resolution_key(&self) -> String {
        format!("{}x{}", self.width.unwrap_or(0), self.height.unwrap_or(0))
    }
}

/// A single downloadable encoding after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatVariant {
    pub format_id: String,
    pub ext: String,
    pub width: u32,
    pub height: u32,
    pub has_video: bool,
    pub has_audio: bool,
    pub filesize: Option<u64>,
    pub bitrate: Option<f64>,
    pub note: String,
}

impl FormatVariant {
    fn from_raw(raw: &RawFormat) -> Self {
        let has_video = raw.has_video();
        Self {
            format_id: raw.format_id.clone().unwrap_or_default(),
            ext: raw.ext.clone().unwrap_or_else(|| "unknown".to_owned()),
            width: if has_video { raw.width.unwrap_or(0) } else { 0 },
            height: if has_video { raw.height.unwrap_or(0) } else { 0 },
            has_video,
            has_audio: raw.has_audio(),
            filesize: raw.filesize.or(raw.filesize_approx),
            bitrate: raw.abr.or(raw.tbr).or(raw.asr),
            note: raw.format_note.clone().unwrap_or_default(),
        }
    }

    pub fn is_audio_only(&self) -> bool {
        !self.has_video && self.has_audio
    }

    /// One-line description such as `1920x1080 mp4 [1080P 高清] 12.40MiB (video only)`.
    pub fn label(&self) -> String {
        let mut parts = Vec::new();
        if self.has_video {
            parts.push(format!("{}x{}", self.width, self.height));
        } else {
            parts.push("audio".to_owned());
        }
        parts.push(self.ext.clone());
        if !self.note.is_empty() {
            parts.push(format!("[{}]", self.note));
        }
        if let Some(size) = self.filesize {
            parts.push(format_bytes(size));
        } else if let Some(bitrate) = self.bitrate {
            parts.push(format!("{bitrate:.0}k"));
        }
        if self.has_video && !self.has_audio {
            parts.push("(video only)".to_owned());
        }
        parts.join(" ")
    }
}

/// Deduplicates `raw` into the user-facing shortlist.
///
/// Video-capable entries are grouped by exact `WxH`, the largest file of each
/// group survives and groups are ordered by height descending. The
/// highest-bitrate audio-only entry, if any, comes last.
pub fn rank(raw: &[RawFormat]) -> Vec<FormatVariant> {
    let mut best_audio: Option<&RawFormat> = None;
    let mut groups: Vec<&RawFormat> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();

    for format in raw {
        if !format.has_video() {
            if format.has_audio()
                && best_audio.is_none_or(|best| format.audio_bitrate() > best.audio_bitrate())
            {
                best_audio = Some(format);
            }
            continue;
        }

        if format.width.unwrap_or(0) == 0 && format.height.unwrap_or(0) == 0 {
            continue;
        }

        let key = format.resolution_key();
        match group_index.get(&key) {
            Some(&index) => {
                if format.size() > groups[index].size() {
                    groups[index] = format;
                }
            }
            None => {
                group_index.insert(key, groups.len());
                groups.push(format);
            }
        }
    }

    groups.sort_by(|a, b| b.height.unwrap_or(0).cmp(&a.height.unwrap_or(0)));

    let mut ranked: Vec<FormatVariant> = groups.into_iter().map(FormatVariant::from_raw).collect();
    if let Some(audio) = best_audio {
        ranked.push(FormatVariant::from_raw(audio));
    }
    ranked
}

/// Builds the `-f` expression for a chosen variant.
///
/// A variant without audio is paired with the best audio stream when
/// `merge_audio` is set. Batches over several playlist entries use a height
/// cap because format IDs are only known for the sampled first entry.
pub fn selection_expression(variant: &FormatVariant, merge_audio: bool, batch: bool) -> String {
    if batch {
        if !variant.has_video {
            return "bestaudio/best".to_owned();
        }
        let height = variant.height;
        return if merge_audio {
            format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
        } else {
            format!("best[height<={height}]/bestvideo[height<={height}]")
        };
    }

    if merge_audio && variant.has_video && !variant.has_audio {
        format!("{}+bestaudio", variant.format_id)
    } else {
        variant.format_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(id: &str, width: u32, height: u32, size: Option<u64>) -> RawFormat {
        RawFormat {
            format_id: Some(id.into()),
            ext: Some("mp4".into()),
            width: Some(width),
            height: Some(height),
            vcodec: Some("avc1.640028".into()),
            acodec: Some("none".into()),
            filesize: size,
            ..RawFormat::default()
        }
    }

    fn audio(id: &str, abr: Option<f64>, tbr: Option<f64>, asr: Option<f64>) -> RawFormat {
        RawFormat {
            format_id: Some(id.into()),
            ext: Some("m4a".into()),
            vcodec: Some("none".into()),
            acodec: Some("mp4a.40.2".into()),
            abr,
            tbr,
            asr,
            ..RawFormat::default()
        }
    }

    fn ids(ranked: &[FormatVariant]) -> Vec<&str> {
        ranked.iter().map(|f| f.format_id.as_str()).collect()
    }

    #[test]
    fn keeps_larger_file_per_resolution() {
        let raw = vec![
            video("small", 1920, 1080, Some(1_048_576)),
            video("large", 1920, 1080, Some(2_097_152)),
        ];
        let ranked = rank(&raw);
        assert_eq!(ids(&ranked), vec!["large"]);
        assert_eq!(ranked[0].filesize, Some(2_097_152));
    }

    #[test]
    fn approximate_size_counts_and_ties_keep_first() {
        let mut approx = video("approx", 1280, 720, None);
        approx.filesize_approx = Some(5_000);
        let raw = vec![
            video("first", 1280, 720, Some(5_000)),
            approx,
            video("unknown", 1280, 720, None),
        ];
        assert_eq!(ids(&rank(&raw)), vec!["first"]);
    }

    #[test]
    fn sorts_by_height_and_appends_best_audio() {
        let raw = vec![
            audio("a-low", Some(64.0), None, None),
            video("360", 640, 360, Some(10)),
            video("1080", 1920, 1080, Some(30)),
            audio("a-high", Some(128.0), None, None),
            video("720", 1280, 720, Some(20)),
        ];
        let ranked = rank(&raw);
        assert_eq!(ids(&ranked), vec!["1080", "720", "360", "a-high"]);
        assert!(ranked[3].is_audio_only());
        assert_eq!(ranked[3].width, 0);
    }

    #[test]
    fn equal_heights_keep_encounter_order() {
        let raw = vec![
            video("vertical", 608, 1080, Some(1)),
            video("wide", 1920, 1080, Some(1)),
            video("square", 1080, 1080, Some(1)),
        ];
        assert_eq!(ids(&rank(&raw)), vec!["vertical", "wide", "square"]);
    }

    #[test]
    fn audio_bitrate_falls_back_through_fields() {
        let raw = vec![
            audio("by-asr", None, None, Some(48_000.0)),
            audio("by-tbr", None, Some(160.0), None),
            audio("nothing", None, None, None),
        ];
        assert_eq!(ids(&rank(&raw)), vec!["by-asr"]);

        let raw = vec![audio("none", None, None, None), audio("tbr", None, Some(1.0), None)];
        assert_eq!(ids(&rank(&raw)), vec!["tbr"]);
    }

    #[test]
    fn drops_unset_resolution_and_storyboards() {
        let mut muxed_unknown = video("muxed", 0, 0, Some(100));
        muxed_unknown.acodec = Some("mp4a".into());
        let storyboard = RawFormat {
            format_id: Some("sb0".into()),
            ext: Some("mhtml".into()),
            width: Some(48),
            height: Some(27),
            vcodec: Some("none".into()),
            acodec: Some("none".into()),
            ..RawFormat::default()
        };
        let raw = vec![muxed_unknown, storyboard, video("480", 854, 480, None)];
        assert_eq!(ids(&rank(&raw)), vec!["480"]);
    }

    #[test]
    fn output_is_unique_sorted_and_idempotent() {
        let raw = vec![
            video("a", 1920, 1080, Some(3)),
            audio("x", Some(50.0), None, None),
            video("b", 1280, 720, Some(9)),
            video("c", 1920, 1080, Some(7)),
            video("d", 3840, 2160, None),
            audio("y", Some(50.0), None, None),
            video("e", 1280, 720, Some(1)),
        ];
        let first = rank(&raw);
        let second = rank(&raw);
        assert_eq!(first, second);
        assert_eq!(ids(&first), vec!["d", "c", "b", "x"]);

        let audio_count = first.iter().filter(|f| f.is_audio_only()).count();
        assert_eq!(audio_count, 1);
        let heights: Vec<u32> = first.iter().filter(|f| f.has_video).map(|f| f.height).collect();
        assert!(heights.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    #[test]
    fn empty_input_gives_empty_shortlist() {
        assert!(rank(&[]).is_empty());
    }

    #[test]
    fn selection_expression_merges_audio_when_missing() {
        let ranked = rank(&[video("137", 1920, 1080, Some(1))]);
        assert_eq!(selection_expression(&ranked[0], true, false), "137+bestaudio");
        assert_eq!(selection_expression(&ranked[0], false, false), "137");

        let mut muxed = video("18", 640, 360, Some(1));
        muxed.acodec = Some("mp4a".into());
        let ranked = rank(&[muxed]);
        assert_eq!(selection_expression(&ranked[0], true, false), "18");
    }

    #[test]
    fn selection_expression_caps_height_for_batches() {
        let ranked = rank(&[video("80", 1920, 1080, Some(1)), audio("30280", Some(320.0), None, None)]);
        assert_eq!(
            selection_expression(&ranked[0], true, true),
            "bestvideo[height<=1080]+bestaudio/best[height<=1080]"
        );
        assert_eq!(selection_expression(&ranked[1], true, true), "bestaudio/best");
    }

    #[test]
    fn label_describes_variant() {
        let ranked = rank(&[video("137", 1920, 1080, Some(1_048_576))]);
        assert_eq!(ranked[0].label(), "1920x1080 mp4 1.00MiB (video only)");
    }
}
