mod media;
mod ml;
mod server;
mod utils;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::media::resize::{ImageResizer, PassthroughResizer, Resizer};
use crate::ml::engine::{ExecutionProvider, ModelKind, OnnxModelLoader};
use crate::ml::session::SessionManager;
use crate::server::{AppState, ServiceSettings};

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP service that removes image backgrounds", long_about = None)]
struct Args {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    #[arg(short, long, env = "MODEL_NAME", value_enum, default_value_t = ModelKind::U2netp)]
    model: ModelKind,

    /// Use this .onnx file instead of searching for `<model>.onnx`.
    #[arg(long, env = "MODEL_PATH")]
    model_path: Option<PathBuf>,

    #[arg(long, env = "EXECUTION_PROVIDER", value_enum, default_value_t = ExecutionProvider::Cpu)]
    provider: ExecutionProvider,

    #[arg(long, env = "INTRA_THREADS", default_value_t = 1)]
    intra_threads: usize,

    #[arg(long, env = "UPLOAD_DIR", default_value = "temp_uploads")]
    upload_dir: PathBuf,

    /// Longest side uploads are scaled down to; 0 keeps the original size.
    #[arg(long, env = "MAX_DIMENSION", default_value_t = 1024)]
    max_dimension: u32,

    #[arg(long, env = "NO_RESIZE")]
    no_resize: bool,

    /// Allow cross-origin requests from any origin.
    #[arg(long, env = "CORS_ALLOW_ALL")]
    cors: bool,

    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 32 * 1024 * 1024)]
    max_upload_bytes: usize,
}

impl Args {
    fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            model: self.model,
            provider: self.provider,
            upload_dir: self.upload_dir.clone(),
            max_dimension: self.max_dimension,
            max_upload_bytes: self.max_upload_bytes,
            allow_cors: self.cors,
        }
    }

    fn resizer(&self) -> Arc<dyn Resizer> {
        if self.no_resize {
            Arc::new(PassthroughResizer)
        } else {
            Arc::new(ImageResizer::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    info!("Background remover starting...");
    info!("Model: {} on {}", args.model, args.provider);
    info!("Uploads: {:?}", args.upload_dir);

    server::prepare_upload_dir(&args.upload_dir)
        .with_context(|| format!("Failed to prepare upload directory {:?}", args.upload_dir))?;

    // The model is not loaded here; the first upload pays for it.
    let loader = OnnxModelLoader::new(args.model_path.clone(), args.intra_threads);
    let state = AppState::new(SessionManager::new(loader), args.resizer(), args.settings());

    let addr = SocketAddr::new(args.host, args.port);
    server::run(state, addr).await
}
