use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use uuid::Uuid;

use listenstats::crypto::AesGcmCipher;

#[derive(Parser)]
#[command(name = "listenstats-cli")]
#[command(about = "Operator CLI for the listenstats internal API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Internal bearer secret.
    #[arg(short, long, env = "LISTENSTATS_INTERNAL_SECRET", default_value = "")]
    secret: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Service status
    Status,
    /// Circuit breaker states per upstream dependency
    Circuits,
    /// Invalidate every session of a principal
    Revoke { principal_id: Uuid },
    /// Print a fresh 256-bit credential encryption key (hex)
    GenKey,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let request = match cli.command {
        Commands::GenKey => {
            println!("{}", AesGcmCipher::generate_key());
            return Ok(());
        }
        Commands::Status => client.get(format!("{base}/internal/status")),
        Commands::Circuits => client.get(format!("{base}/internal/circuits")),
        Commands::Revoke { principal_id } => {
            client.post(format!("{base}/internal/principals/{principal_id}/revoke"))
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.secret))?,
    );
    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: internal API returned status {status}");
        if let Ok(text) = res.text().await {
            eprintln!("Response: {text}");
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
