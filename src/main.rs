use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::env;
use std::sync::Arc;

use yt_dlp_queue::config::{get_config_path, load_config, Config};
use yt_dlp_queue::handlers;
use yt_dlp_queue::{
    AppState, FileContainer, LifecycleEvent, MetadataEvent, Orchestrator, QualityTier,
};

// --- Command-Line Argument Parsing ---
#[derive(Parser, Debug)]
#[command(author, version, about = "Queued yt-dlp downloads with ffmpeg conversion.", long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Per-run overrides of the config file.
#[derive(Args, Debug)]
struct Overrides {
    /// Path to the yt-dlp executable.
    #[arg(long, global = true)]
    ytdlp: Option<String>,
    /// Path to the ffmpeg executable.
    #[arg(long, global = true)]
    ffmpeg: Option<String>,
    /// Directory finished files are moved into.
    #[arg(long, short, global = true)]
    output: Option<String>,
    /// Network timeout handed to yt-dlp, in seconds.
    #[arg(long, global = true)]
    socket_timeout: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.ytdlp {
            config.ytdlp_path = Some(path.clone());
        }
        if let Some(path) = &self.ffmpeg {
            config.ffmpeg_path = Some(path.clone());
        }
        if let Some(dir) = &self.output {
            config.download_directory = dir.clone();
        }
        if let Some(secs) = self.socket_timeout {
            config.socket_timeout_secs = secs;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the videos behind one or more URLs.
    Info {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Download the first video behind a URL.
    Download {
        url: String,
        /// One of: audio, 144, 240, 360, 480, 720, 1080.
        #[arg(long, short, default_value = "720")]
        quality: QualityTier,
        /// One of: mp3, wav, original, mkv, mp4.
        #[arg(long, short, default_value = "original")]
        container: FileContainer,
    },
    /// Run the HTTP API in the foreground.
    Serve,
    /// Inspect the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Print where the configuration file lives.
    Path,
}

// --- Main Application Logic ---
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = load_config().await?;
    cli.overrides.apply(&mut config);

    match cli.command {
        Commands::Info { urls } => info(&config, urls).await?,
        Commands::Download { url, quality, container } => {
            download(&config, url, quality, container).await?
        }
        Commands::Serve => run_server(config).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", toml::to_string_pretty(&config)?),
            ConfigAction::Path => println!("{}", get_config_path().await?.display()),
        },
    }

    Ok(())
}

fn start_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let settings = config.to_settings().context("Invalid tool configuration")?;
    Ok(Orchestrator::start(settings)?)
}

// --- Command Functions ---

async fn info(config: &Config, urls: Vec<String>) -> anyhow::Result<()> {
    let orchestrator = start_orchestrator(config)?;
    let mut events = orchestrator.fetch_metadata(urls);

    let mut success = false;
    while let Some(event) = events.next().await {
        match event {
            MetadataEvent::Record(record) => println!("{}", record),
            MetadataEvent::Finished { success: ok } => success = ok,
        }
    }
    orchestrator.shutdown().await;

    if !success {
        bail!("yt-dlp reported an error for at least one URL");
    }
    Ok(())
}

async fn download(
    config: &Config,
    url: String,
    quality: QualityTier,
    container: FileContainer,
) -> anyhow::Result<()> {
    let orchestrator = start_orchestrator(config)?;
    let result = run_download(&orchestrator, url, quality, container).await;
    orchestrator.shutdown().await;
    result
}

async fn run_download(
    orchestrator: &Orchestrator,
    url: String,
    quality: QualityTier,
    container: FileContainer,
) -> anyhow::Result<()> {
    let (records, _) = orchestrator.fetch_metadata_one(url.as_str()).collect().await;
    let Some(record) = records.into_iter().next() else {
        bail!("No downloadable video found at {}", url);
    };
    println!("{}", record.title);

    let mut events = orchestrator.download(record, quality, container);
    while let Some(event) = events.next().await {
        match event {
            LifecycleEvent::Queued => println!("Queued"),
            LifecycleEvent::Starting => println!("Starting"),
            LifecycleEvent::Downloading { percent, speed, eta } => println!(
                "Downloading {:5.1}% at {} ETA {}",
                percent,
                speed,
                eta.as_deref().unwrap_or("?")
            ),
            LifecycleEvent::Converting { percent, remaining } => println!(
                "Converting {:5.1}%, {} left",
                percent,
                remaining.as_deref().unwrap_or("?")
            ),
            LifecycleEvent::Completed { path } => println!("Saved to {}", path.display()),
            LifecycleEvent::Aborted { reason } => bail!("Download aborted: {}", reason),
        }
    }
    Ok(())
}

/// Runs the Axum web server until Ctrl-C.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let orchestrator = Arc::new(start_orchestrator(&config)?);
    let state = AppState::new(config, Arc::clone(&orchestrator));

    let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port_str = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("{}:{}", host, port_str);
    let app = handlers::router(state);

    tracing::info!("Starting server in foreground, listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}
