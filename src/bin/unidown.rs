#![forbid(unsafe_code)]

//! Command-line front-end: analyze a link, pick a format, download.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::{signal, task};
use tracing_subscriber::EnvFilter;
use unidown::config::{Settings, default_config_path, load_settings_from, save_settings_to};
use unidown::controller::{Controller, SelectionRequest, TaskEvent};
use unidown::executor::CancelToken;
use unidown::normalize::{Platform, detect_platform, normalize};
use unidown::resolver::VideoMetadata;
use unidown::text::format_duration;
use unidown::yt_dlp::YtDlp;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about = "Download videos from Bilibili and YouTube.")]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        global = true,
        help = "Settings file (default: $UNIDOWN_CONFIG or <config dir>/unidown/env)"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show title, entries and available formats without downloading.
    Analyze(Target),
    /// Analyze, then download the chosen format.
    Download(DownloadArgs),
    /// Print or update the saved settings.
    Settings(SettingsArgs),
}

#[derive(Args, Debug)]
struct Target {
    #[arg(value_name = "TEXT", help = "URL, short link, bare ID, or text containing one")]
    text: String,
    #[arg(
        short = 'p',
        long = "platform",
        value_name = "NAME",
        help = "bilibili or youtube (default: guessed from the text)"
    )]
    platform: Option<Platform>,
}

#[derive(Args, Debug)]
struct DownloadArgs {
    #[command(flatten)]
    target: Target,
    #[arg(
        short = 'f',
        long = "format",
        value_name = "ID",
        conflicts_with = "height",
        help = "Format ID from `unidown analyze`"
    )]
    format: Option<String>,
    #[arg(long = "height", value_name = "PIXELS", help = "Best format at or below this height")]
    height: Option<u32>,
    #[arg(
        short = 'i',
        long = "items",
        value_name = "LIST",
        help = "Playlist entries to fetch, e.g. 1,3-5 (default: all)"
    )]
    items: Option<ItemList>,
    #[arg(long = "no-merge-audio", help = "Do not add the best audio to video-only formats")]
    no_merge_audio: bool,
    #[arg(
        short = 'o',
        long = "output",
        value_name = "DIR",
        help = "Override the download directory"
    )]
    output: Option<PathBuf>,
    #[arg(
        long = "retries",
        value_name = "N",
        default_value_t = 0,
        help = "Re-download items whose file is missing afterwards, up to N times"
    )]
    retries: u32,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    #[arg(long = "download-dir", value_name = "DIR")]
    download_dir: Option<PathBuf>,
    #[arg(long = "proxy", value_name = "URL", conflicts_with = "clear_proxy")]
    proxy: Option<String>,
    #[arg(long = "clear-proxy", help = "Remove the saved proxy")]
    clear_proxy: bool,
    #[arg(long = "cookies-from-browser", value_name = "BROWSER")]
    cookies_from_browser: Option<String>,
    #[arg(long = "yt-dlp", value_name = "PATH")]
    yt_dlp: Option<PathBuf>,
}

/// `1,3-5` style list of 1-based indices.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ItemList(Vec<usize>);

impl FromStr for ItemList {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut indices = Vec::new();
        for part in value.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let parse = |raw: &str| {
                raw.trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|index| *index > 0)
                    .ok_or_else(|| format!("invalid item number: {raw}"))
            };
            match part.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse(start)?, parse(end)?);
                    if start > end {
                        return Err(format!("invalid range: {part}"));
                    }
                    indices.extend(start..=end);
                }
                None => indices.push(parse(part)?),
            }
        }
        if indices.is_empty() {
            return Err("no items given".to_owned());
        }
        Ok(ItemList(indices))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let interrupt = CancelToken::new();

    match cli.command {
        Command::Analyze(target) => {
            let settings = load_settings_from(&config_path)?;
            run_with_ctrl_c(&interrupt, move |interrupt| {
                analyze(interrupt, &target, settings)
            })
            .await
        }
        Command::Download(args) => {
            let mut settings = load_settings_from(&config_path)?;
            if let Some(output) = &args.output {
                settings.download_dir = output.clone();
            }
            run_with_ctrl_c(&interrupt, move |interrupt| {
                download(interrupt, &args, settings)
            })
            .await
        }
        Command::Settings(args) => update_settings(&config_path, args),
    }
}

/// Runs a blocking job on the tokio blocking pool while Ctrl+C turns into a
/// cancellation request on the job's token.
async fn run_with_ctrl_c<F>(token: &CancelToken, job: F) -> Result<()>
where
    F: FnOnce(&CancelToken) -> Result<()> + Send + 'static,
{
    let watcher_token = token.clone();
    let watcher = tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            eprintln!("Failed to install Ctrl+C handler: {}", err);
            return;
        }
        eprintln!("\nCancelling...");
        watcher_token.cancel();
    });

    let job_token = token.clone();
    let result = task::spawn_blocking(move || job(&job_token))
        .await
        .context("background job panicked")?;
    watcher.abort();
    result
}

fn pick_platform(target: &Target) -> Platform {
    target
        .platform
        .or_else(|| detect_platform(&normalize(&target.text, Platform::YouTube)))
        .unwrap_or(Platform::YouTube)
}

fn open_controller(
    target: &Target,
    settings: &Settings,
    interrupt: &CancelToken,
) -> Result<Controller> {
    let version = YtDlp::from_settings(settings)
        .ensure_available()
        .context("yt-dlp is required; install it or set YT_DLP_PATH")?;
    tracing::debug!(version = %version, "found yt-dlp");
    let platform = pick_platform(target);
    let controller = Controller::for_platform(platform, settings);
    if interrupt.is_cancelled() {
        bail!("interrupted");
    }
    Ok(controller)
}

/// Forwards Ctrl+C from `interrupt` to the controller's own token while
/// draining events until one that ends the current phase.
fn pump(controller: &mut Controller, interrupt: &CancelToken) -> TaskEvent {
    let mut forwarded = false;
    let mut progress_shown = false;
    loop {
        if interrupt.is_cancelled() && !forwarded {
            controller.cancel();
            forwarded = true;
        }
        match controller.wait_event(POLL_INTERVAL) {
            Some(TaskEvent::Progress(text)) => {
                print!("\r\x1b[2K{text}");
                io::stdout().flush().ok();
                progress_shown = true;
            }
            Some(event) => {
                if progress_shown {
                    println!();
                }
                return event;
            }
            None => {}
        }
    }
}

fn resolve(
    controller: &mut Controller,
    target: &Target,
    settings: &Settings,
    interrupt: &CancelToken,
) -> Result<VideoMetadata> {
    let url = controller.analyze(&target.text, settings.clone())?;
    tracing::info!(url = %url, "analyzing");
    match pump(controller, interrupt) {
        TaskEvent::Resolved(metadata) => Ok(metadata),
        TaskEvent::Error(message) => bail!("analysis failed: {message}"),
        TaskEvent::Cancelled => bail!("analysis cancelled"),
        other => bail!("unexpected event during analysis: {other:?}"),
    }
}

fn analyze(interrupt: &CancelToken, target: &Target, settings: Settings) -> Result<()> {
    let mut controller = open_controller(target, &settings, interrupt)?;
    let metadata = resolve(&mut controller, target, &settings, interrupt)?;
    controller.decline()?;
    print_metadata(&metadata);
    Ok(())
}

fn print_metadata(metadata: &VideoMetadata) {
    println!("Title:    {}", metadata.title);
    if let Some(duration) = metadata.duration {
        println!("Duration: {}", format_duration(duration));
    }
    println!("URL:      {}", metadata.webpage_url);

    if metadata.is_playlist {
        println!("\nEntries ({}):", metadata.entries.len());
        for entry in &metadata.entries {
            let duration = entry.duration.map(format_duration).unwrap_or_default();
            println!("  {:>3}. {} {}", entry.index, entry.title, duration);
        }
    }

    println!("\nFormats:");
    for format in &metadata.formats {
        println!("  {:>10}  {}", format.format_id, format.label());
    }
}

fn choose_format(metadata: &VideoMetadata, args: &DownloadArgs) -> Result<String> {
    if let Some(id) = &args.format {
        if metadata.format(id).is_none() {
            bail!("format {id} is not available; run `unidown analyze` to list formats");
        }
        return Ok(id.clone());
    }
    let chosen = match args.height {
        Some(limit) => metadata
            .formats
            .iter()
            .find(|format| format.has_video && format.height <= limit)
            .with_context(|| format!("no video format at or below {limit}p"))?,
        None => metadata
            .formats
            .first()
            .context("no downloadable formats")?,
    };
    Ok(chosen.format_id.clone())
}

fn download(interrupt: &CancelToken, args: &DownloadArgs, settings: Settings) -> Result<()> {
    let mut controller = open_controller(&args.target, &settings, interrupt)?;
    let metadata = resolve(&mut controller, &args.target, &settings, interrupt)?;

    let format_id = choose_format(&metadata, args)?;
    let entries = match &args.items {
        Some(ItemList(indices)) => indices.clone(),
        None => metadata.entries.iter().map(|entry| entry.index).collect(),
    };
    println!(
        "Downloading {} ({})",
        metadata.title,
        metadata
            .format(&format_id)
            .map(|format| format.label())
            .unwrap_or_default()
    );

    let request = SelectionRequest {
        format_id,
        merge_audio: !args.no_merge_audio,
        entries,
    };
    controller.select(&request, settings.clone())?;

    let mut last = pump(&mut controller, interrupt);
    for attempt in 1..=args.retries {
        if matches!(last, TaskEvent::Cancelled) || interrupt.is_cancelled() {
            break;
        }
        let started = controller.retry_missing(settings.clone())?;
        if started == 0 {
            break;
        }
        println!("Retry {attempt}/{}: {started} item(s) missing", args.retries);
        last = pump(&mut controller, interrupt);
    }

    match last {
        TaskEvent::Completed(message) => {
            println!("{message}");
            Ok(())
        }
        TaskEvent::Cancelled => bail!("download cancelled"),
        TaskEvent::Error(message) => bail!("{message}"),
        other => bail!("unexpected event during download: {other:?}"),
    }
}

fn update_settings(config_path: &Path, args: SettingsArgs) -> Result<()> {
    let mut settings = load_settings_from(config_path)?;
    let original = settings.clone();

    if let Some(dir) = args.download_dir {
        settings.download_dir = dir;
    }
    if args.clear_proxy {
        settings.proxy = None;
    } else if let Some(proxy) = args.proxy {
        settings.proxy = Some(proxy).filter(|value| !value.trim().is_empty());
    }
    if let Some(browser) = args.cookies_from_browser {
        settings.cookies_from_browser = Some(browser).filter(|value| !value.trim().is_empty());
    }
    if let Some(path) = args.yt_dlp {
        settings.yt_dlp_path = path;
    }

    if settings != original {
        save_settings_to(config_path, &settings)?;
        println!("Saved {}", config_path.display());
    }

    println!("Config file:          {}", config_path.display());
    println!("Download directory:   {}", settings.download_dir.display());
    println!("Proxy:                {}", settings.proxy.as_deref().unwrap_or("(none)"));
    println!(
        "Cookies from browser: {}",
        settings.cookies_from_browser.as_deref().unwrap_or("(none)")
    );
    println!("yt-dlp:               {}", settings.yt_dlp_path.display());
    Ok(())
}
