use anyhow::{Context, Result};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

pub const CONFIG_ENV_VAR: &str = "UNIDOWN_CONFIG";
pub const DEFAULT_YT_DLP: &str = "yt-dlp";
const CONFIG_DIR_NAME: &str = "unidown";
const CONFIG_FILE_NAME: &str = "env";

/// Values present in the settings file. Missing keys stay `None` so callers
/// can tell "unset" apart from "set to the default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub download_dir: Option<PathBuf>,
    pub proxy: Option<String>,
    pub cookies_from_browser: Option<String>,
    pub yt_dlp_path: Option<PathBuf>,
}

/// Snapshot handed to every analysis and download. Never mutated while a task
/// runs; the controller clones a fresh one per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub download_dir: PathBuf,
    pub proxy: Option<String>,
    pub cookies_from_browser: Option<String>,
    pub yt_dlp_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            proxy: None,
            cookies_from_browser: None,
            yt_dlp_path: PathBuf::from(DEFAULT_YT_DLP),
        }
    }
}

impl Settings {
    fn from_env_config(cfg: EnvConfig) -> Self {
        let defaults = Settings::default();
        Self {
            download_dir: cfg.download_dir.unwrap_or(defaults.download_dir),
            proxy: cfg.proxy,
            cookies_from_browser: cfg.cookies_from_browser,
            yt_dlp_path: cfg.yt_dlp_path.unwrap_or(defaults.yt_dlp_path),
        }
    }
}

/// The user's download folder, falling back to the working directory.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `$UNIDOWN_CONFIG`, else `<config dir>/unidown/env`, else `./unidown.env`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from("unidown.env"))
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "DOWNLOAD_DIR" => cfg.download_dir = Some(PathBuf::from(value)),
                "PROXY" => cfg.proxy = Some(value.to_string()),
                "COOKIES_FROM_BROWSER" => cfg.cookies_from_browser = Some(value.to_string()),
                "YT_DLP_PATH" => cfg.yt_dlp_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from(default_config_path())
}

/// Reads the settings file, filling anything missing with defaults. A missing
/// file is not an error.
pub fn load_settings_from(path: impl AsRef<Path>) -> Result<Settings> {
    let cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    Ok(Settings::from_env_config(cfg))
}

/// Writes every setting back in the same `KEY="value"` format.
pub fn save_settings_to(path: impl AsRef<Path>, settings: &Settings) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let mut content = String::new();
    content.push_str(&format!(
        "DOWNLOAD_DIR=\"{}\"\n",
        settings.download_dir.display()
    ));
    if let Some(proxy) = &settings.proxy {
        content.push_str(&format!("PROXY=\"{proxy}\"\n"));
    }
    if let Some(browser) = &settings.cookies_from_browser {
        content.push_str(&format!("COOKIES_FROM_BROWSER=\"{browser}\"\n"));
    }
    content.push_str(&format!(
        "YT_DLP_PATH=\"{}\"\n",
        settings.yt_dlp_path.display()
    ));

    fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}
