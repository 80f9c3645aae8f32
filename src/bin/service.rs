use facegate::common::{Config, Paths};
use facegate::core::{AuthEngine, FaceTemplateStore, LocalVision, Vision};
use facegate::service::AuthServer;
use facegate::storage::{FileUserStore, UserStore};

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facegate-server")]
#[command(about = "Password + face authentication server")]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(value_name = "PORT")]
    port: Option<u16>,

    /// Config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Model path for the face detector (overrides the config file)
    #[arg(long)]
    detector_model: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(model) = args.detector_model {
        config.detector.model_path = model;
    }
    config.validate()?;

    tracing::info!("Starting facegate server on port {}", config.server.port);

    let paths = Paths::new(&config.storage.data_dir);
    paths.bootstrap().context("Failed to prepare data directory")?;

    let vision: Arc<dyn Vision> = Arc::new(LocalVision::new(&config).context("Failed to load face detector")?);
    let users: Arc<dyn UserStore> = Arc::new(
        FileUserStore::open(&paths, config.storage.retain_login_images).context("Failed to open user store")?,
    );
    let templates = Arc::new(
        FaceTemplateStore::open(Arc::clone(&vision), &paths.models_dir()).context("Failed to load face templates")?,
    );
    tracing::info!("{} user(s) have face templates", templates.user_count());

    let engine = Arc::new(AuthEngine::new(&config, paths, vision, users, templates));
    let mut server = AuthServer::start(&config.server, engine)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to install signal handler")?;

    println!("facegate server listening on {} (Ctrl+C to stop)", server.local_addr());
    let _ = rx.recv();

    tracing::info!("Shutdown requested, waiting for active connections");
    server.stop();
    Ok(())
}

fn setup_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    }
}
