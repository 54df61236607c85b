use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the resilience gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway status
    Status,
    /// List circuit breakers, or show one
    Breakers { service: Option<String> },
    /// Force a breaker open
    Open {
        service: String,
        /// Open duration; defaults to the breaker's reset timeout
        #[arg(long)]
        duration_ms: Option<u64>,
    },
    /// Force a breaker closed
    Close { service: String },
    /// Reset a breaker and its statistics
    Reset { service: String },
    /// Show rate limit statistics and settings
    RateLimit,
    /// Blacklist a scope (e.g. ip:10.0.0.1)
    Blacklist {
        scope: String,
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Remove the scope instead
        #[arg(long)]
        remove: bool,
    },
    /// Whitelist a scope (e.g. user:42)
    Whitelist {
        scope: String,
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Remove the scope instead
        #[arg(long)]
        remove: bool,
    },
    /// Show the aggregate health report
    Health,
    /// List degradation strategies
    Degradation,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let (method, path, body) = match cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string(), None),
        Commands::Breakers { service: None } => (Method::GET, "/admin/breakers".to_string(), None),
        Commands::Breakers { service: Some(s) } => {
            (Method::GET, format!("/admin/breakers/{s}"), None)
        }
        Commands::Open { service, duration_ms } => {
            let query = duration_ms.map(|ms| format!("?duration_ms={ms}")).unwrap_or_default();
            (Method::POST, format!("/admin/breakers/{service}/open{query}"), None)
        }
        Commands::Close { service } => (Method::POST, format!("/admin/breakers/{service}/close"), None),
        Commands::Reset { service } => (Method::POST, format!("/admin/breakers/{service}/reset"), None),
        Commands::RateLimit => (Method::GET, "/admin/rate-limit".to_string(), None),
        Commands::Blacklist { scope, duration_ms, remove } => {
            scope_request("blacklist", scope, duration_ms, remove)
        }
        Commands::Whitelist { scope, duration_ms, remove } => {
            scope_request("whitelist", scope, duration_ms, remove)
        }
        Commands::Health => (Method::GET, "/admin/health".to_string(), None),
        Commands::Degradation => (Method::GET, "/admin/degradation".to_string(), None),
    };

    let mut request = client
        .request(method, format!("{}{}", cli.url, path))
        .headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }
    print_response(request.send().await?).await
}

fn scope_request(
    list: &str,
    scope: String,
    duration_ms: Option<u64>,
    remove: bool,
) -> (Method, String, Option<Value>) {
    if remove {
        (Method::DELETE, format!("/admin/{list}/{scope}"), None)
    } else {
        (
            Method::POST,
            format!("/admin/{list}"),
            Some(json!({ "scope": scope, "duration_ms": duration_ms })),
        )
    }
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
