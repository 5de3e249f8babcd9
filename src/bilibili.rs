//! Lightweight probe against Bilibili's public view API.
//!
//! A single request tells us whether a video is a multi-part work and lists
//! its parts, which is far cheaper than letting yt-dlp walk every page.

use serde::Deserialize;
use tracing::debug;

use crate::error::ProbeError;
use crate::normalize::{Platform, bilibili_video_id};

const VIEW_API: &str = "https://api.bilibili.com/x/web-interface/view";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const REFERER: &str = "https://www.bilibili.com/";
const MAX_REDIRECTS: u32 = 5;

/// One part of a multi-part work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkPart {
    pub page: u32,
    pub title: String,
    pub duration: Option<u64>,
    pub url: String,
}

/// What the probe learned about a work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkParts {
    pub title: String,
    pub url: String,
    pub parts: Vec<WorkPart>,
}

/// Platform API able to list the parts of a work without full extraction.
pub trait PartsProbe: Send + Sync {
    /// Whether `url` is something this probe understands.
    fn supports(&self, url: &str) -> bool;

    fn probe(&self, url: &str, proxy: Option<&str>) -> Result<WorkParts, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct ViewResponse {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<ViewData>,
}

#[derive(Debug, Deserialize)]
struct ViewData {
    bvid: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    pages: Vec<ViewPage>,
}

#[derive(Debug, Deserialize)]
struct ViewPage {
    page: u32,
    #[serde(default)]
    part: String,
    duration: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct BilibiliApi;

impl BilibiliApi {
    pub fn new() -> Self {
        Self
    }

    fn agent(proxy: Option<&str>) -> Result<ureq::Agent, ProbeError> {
        let mut builder = ureq::AgentBuilder::new()
            .user_agent(USER_AGENT)
            .redirects(MAX_REDIRECTS);
        if let Some(proxy) = proxy.filter(|value| !value.is_empty()) {
            let proxy = ureq::Proxy::new(proxy).map_err(|err| ProbeError::Http(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        Ok(builder.build())
    }

    /// Follows a `b23.tv` short link and returns the URL it lands on.
    fn follow_short_link(agent: &ureq::Agent, url: &str) -> Result<String, ProbeError> {
        let response = agent
            .get(url)
            .set("Referer", REFERER)
            .call()
            .map_err(|err| ProbeError::Http(err.to_string()))?;
        Ok(response.get_url().to_owned())
    }
}

impl PartsProbe for BilibiliApi {
    fn supports(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        lower.contains("b23.tv/") || lower.contains("bilibili.com/video/")
    }

    fn probe(&self, url: &str, proxy: Option<&str>) -> Result<WorkParts, ProbeError> {
        let agent = Self::agent(proxy)?;

        let page_url = if url.to_ascii_lowercase().contains("b23.tv/") {
            let landed = Self::follow_short_link(&agent, url)?;
            debug!(short = url, landed = %landed, "followed short link");
            landed
        } else {
            url.to_owned()
        };

        let id = bilibili_video_id(&page_url)
            .ok_or_else(|| ProbeError::Unsupported(page_url.clone()))?;
        let request = agent.get(VIEW_API).set("Referer", REFERER);
        let request = match id.strip_prefix("av") {
            Some(aid) => request.query("aid", aid),
            None => request.query("bvid", &id),
        };

        let response: ViewResponse = request
            .call()
            .map_err(|err| ProbeError::Http(err.to_string()))?
            .into_json()
            .map_err(|err| ProbeError::InvalidResponse(err.to_string()))?;

        parse_view_response(response, &id)
    }
}

fn parse_view_response(response: ViewResponse, id: &str) -> Result<WorkParts, ProbeError> {
    if response.code != 0 {
        return Err(ProbeError::Api {
            code: response.code,
            message: response.message,
        });
    }
    let data = response
        .data
        .ok_or_else(|| ProbeError::InvalidResponse("missing data payload".to_owned()))?;

    let video_id = data.bvid.unwrap_or_else(|| id.to_owned());
    let base_url = Platform::Bilibili.video_url(&video_id);
    let parts = data
        .pages
        .into_iter()
        .map(|page| WorkPart {
            url: format!("{base_url}?p={}", page.page),
            title: if page.part.trim().is_empty() {
                format!("P{}", page.page)
            } else {
                page.part
            },
            page: page.page,
            duration: page.duration,
        })
        .collect();

    Ok(WorkParts {
        title: data.title,
        url: base_url,
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<WorkParts, ProbeError> {
        let response: ViewResponse = serde_json::from_str(json).unwrap();
        parse_view_response(response, "BV1xx411c7mD")
    }

    #[test]
    fn parses_multi_part_work() {
        let parts = parse(
            r#"{"code":0,"message":"0","data":{"bvid":"BV1xx411c7mD","title":"合集","pages":[
                {"cid":1,"page":1,"part":"第一集","duration":300},
                {"cid":2,"page":2,"part":"","duration":420}
            ]}}"#,
        )
        .unwrap();
        assert_eq!(parts.title, "合集");
        assert_eq!(parts.url, "https://www.bilibili.com/video/BV1xx411c7mD");
        assert_eq!(parts.parts.len(), 2);
        assert_eq!(parts.parts[0].title, "第一集");
        assert_eq!(parts.parts[1].title, "P2");
        assert_eq!(parts.parts[1].url, "https://www.bilibili.com/video/BV1xx411c7mD?p=2");
        assert_eq!(parts.parts[1].duration, Some(420));
    }

    #[test]
    fn non_zero_code_is_an_api_error() {
        let err = parse(r#"{"code":-404,"message":"啥都木有","data":null}"#).unwrap_err();
        assert!(matches!(err, ProbeError::Api { code: -404, .. }));
    }

    #[test]
    fn missing_data_is_invalid() {
        let err = parse(r#"{"code":0}"#).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidResponse(_)));
    }

    #[test]
    fn supports_video_pages_and_short_links_only() {
        let api = BilibiliApi::new();
        assert!(api.supports("https://www.bilibili.com/video/BV1xx411c7mD"));
        assert!(api.supports("https://b23.tv/AbC123x"));
        assert!(!api.supports("https://www.bilibili.com/bangumi/play/ep1"));
        assert!(!api.supports("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
    }
}
