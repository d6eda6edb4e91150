use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "router-cli")]
#[command(about = "Query a droplet-router status server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8082")]
    url: String,

    /// Basic auth user, if the status server requires one
    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check router health
    Healthz,
    /// Show request, response and latency counters
    Varz,
    /// List registered routes and their backends
    Routes,
}

impl Commands {
    fn path(&self) -> &'static str {
        match self {
            Commands::Healthz => "/healthz",
            Commands::Varz => "/varz",
            Commands::Routes => "/routes",
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut request = client.get(format!("{}{}", cli.url.trim_end_matches('/'), cli.command.path()));
    if let Some(user) = &cli.user {
        request = request.basic_auth(user, cli.password.as_deref());
    }

    let res = request.send().await?;
    match cli.command {
        Commands::Healthz => print_text(res).await,
        Commands::Varz | Commands::Routes => print_json(res).await,
    }
}

async fn check_status(res: reqwest::Response) -> Result<Option<reqwest::Response>, Box<dyn std::error::Error>> {
    let status = res.status();
    if status.is_success() {
        return Ok(Some(res));
    }
    eprintln!("Error: status server returned {}", status);
    if let Ok(text) = res.text().await {
        eprintln!("Response: {}", text);
    }
    Ok(None)
}

async fn print_text(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(res) = check_status(res).await? {
        println!("{}", res.text().await?.trim_end());
    }
    Ok(())
}

async fn print_json(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(res) = check_status(res).await? {
        let json: Value = res.json().await?;
        println!("{}", serde_json::to_string_pretty(&json)?);
    }
    Ok(())
}
