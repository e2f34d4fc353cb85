use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod attachment;
mod conversation;
mod export;
mod models;
mod preferences;
mod prompt;
mod server;
mod session;
mod settings;
mod storage;
mod store;
mod studio;

use attachment::{parse_data_url, RawFile};
use models::GeminiModel;
use prompt::AspectRatio;
use session::ReplyState;
use settings::{resolve_effective_settings, EffectiveSettings, EnvDefaults, RequestOverrides};
use storage::SqliteKeyValueStore;
use studio::{ComposePatch, Studio};

#[derive(Debug, Parser)]
#[command(name = "vision_studio")]
#[command(about = "Creative assistant back end for image generation and chat", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        /// SQLite database URL.
        #[arg(long)]
        db: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Send one message in the active session and print the reply.
    Ask {
        text: String,
        #[arg(long = "image")]
        images: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t = AspectRatio::Square)]
        aspect_ratio: AspectRatio,
        #[arg(long)]
        db: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Write a returned image here instead of printing its data URL.
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Write the project source archive.
    Export {
        #[arg(long, default_value = export::ARCHIVE_NAME)]
        out: PathBuf,
    },
}

async fn open_studio(settings: &EffectiveSettings) -> anyhow::Result<Studio> {
    if settings.api_key.is_none() {
        warn!("no GEMINI_API_KEY or API_KEY set, model calls will be rejected");
    }
    let kv = SqliteKeyValueStore::initialize(settings.database_url.clone()).await?;
    let model = GeminiModel::new(settings.base_url.clone(), settings.api_key.clone(), settings.model.clone());
    info!(model = %settings.model, "using model");
    Ok(Studio::load(Arc::new(kv), Arc::new(model)).await)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let env = EnvDefaults::from_env();
    match cli.command {
        Commands::Serve { listen, db, model, base_url } => {
            let addr: SocketAddr = listen.parse()?;
            let settings = resolve_effective_settings(&env, &RequestOverrides { model, base_url, database_url: db });
            let metrics = PrometheusBuilder::new().install_recorder()?;
            let studio = open_studio(&settings).await?;
            server::serve(addr, server::AppState { studio, metrics: Some(metrics) }).await?;
        }
        Commands::Ask { text, images, aspect_ratio, db, model, save } => {
            let settings = resolve_effective_settings(&env, &RequestOverrides { model, base_url: None, database_url: db });
            let studio = open_studio(&settings).await?;
            if !images.is_empty() {
                let report = studio.attach(images.into_iter().map(RawFile::from_path).collect()).await;
                if !report.failed.is_empty() || report.rejected_non_image > 0 || report.dropped_over_quota > 0 {
                    warn!(?report, "some images were not attached");
                }
            }
            studio
                .update_compose(ComposePatch { text: Some(text), aspect_ratio: Some(aspect_ratio), aspect_menu_open: None })
                .await;
            let ids = studio.submit_and_wait().await?;

            let store = studio.read().await;
            let reply = store
                .session(ids.session_id)
                .and_then(|s| s.bot(ids.bot_id))
                .map(|b| b.reply.clone());
            match reply {
                Some(ReplyState::Answered { text, image_url }) => {
                    if let Some(text) = text {
                        println!("{text}");
                    }
                    match (image_url, save) {
                        (Some(url), Some(path)) => {
                            let (_, data) = parse_data_url(&url).ok_or_else(|| anyhow::anyhow!("reply image is not a data URL"))?;
                            tokio::fs::write(&path, BASE64_STANDARD.decode(data)?).await?;
                            println!("image saved to {}", path.display());
                        }
                        (Some(url), None) => println!("{url}"),
                        (None, _) => {}
                    }
                }
                Some(ReplyState::Empty { message }) => println!("{message}"),
                Some(ReplyState::Failed { message }) => anyhow::bail!(message),
                Some(ReplyState::Loading) | None => anyhow::bail!("no reply recorded"),
            }
        }
        Commands::Export { out } => {
            let bytes = export::project_archive()?;
            tokio::fs::write(&out, bytes).await?;
            println!("wrote {}", out.display());
        }
    }
    Ok(())
}
