use facegate::service::{FaceGateClient, Response, ResponseKind};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(about = "Client for the facegate password + face authentication server")]
struct Cli {
    /// Server address
    #[arg(short, long, global = true, default_value = "127.0.0.1:8080")]
    server: String,

    /// Response timeout in seconds
    #[arg(long, global = true, default_value = "60")]
    timeout: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new user with a face image
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
        /// JPEG image containing the user's face
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Log in with password and face image
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Replace the enrollment face of an existing user
    UpdateFace {
        #[arg(long)]
        user_id: i32,
        #[arg(short, long)]
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let client = FaceGateClient::new(cli.server.clone()).with_timeout(Duration::from_secs(cli.timeout));

    let response = match cli.command {
        Commands::Register { username, password, image } => {
            client.register(&username, &password, read_image(&image)?)?
        }
        Commands::Login { username, password, image } => {
            client.login(&username, &password, read_image(&image)?)?
        }
        Commands::UpdateFace { user_id, image } => client.update_face(user_id, read_image(&image)?)?,
    };

    print_response(&response);
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))
}

fn print_response(response: &Response) {
    let status = match (response.kind, response.success) {
        (ResponseKind::Error, _) => "❌ Server error",
        (_, true) => "✅",
        (_, false) => "❌",
    };
    println!("{} {}", status, response.message);
    for (key, value) in &response.extra {
        println!("   {}: {}", key, value);
    }
}

fn setup_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(std::io::stderr)
            .init();
    }
}
