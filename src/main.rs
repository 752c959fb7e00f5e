//! Booklend - book lending daemon and client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use booklend::{
    api::{self, ApiState},
    model::{BookUpload, Status, WorkflowType},
    node::{LendingNode, NodeConfig},
};

/// Book lending between libraries, workers and keepers.
#[derive(Parser)]
#[command(name = "booklend", about = "Book lending daemon")]
struct Cli {
    /// Lending API URL for client commands.
    #[arg(long, global = true, env = "BOOKLEND_API_URL", default_value = "http://localhost:7979")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API daemon.
    Daemon {
        /// Address to bind the API server.
        #[arg(long, default_value = "0.0.0.0:7979", env = "BOOKLEND_BIND")]
        bind: String,

        /// TOML config file.
        #[arg(long, env = "BOOKLEND_CONFIG")]
        config: Option<PathBuf>,

        /// Data directory, overrides the config file.
        #[arg(long, env = "BOOKLEND_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Show daemon status and lending rules.
    Status,

    /// Upload a JSON array of books.
    Upload {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// Start a loan.
    Borrow {
        /// Public record id of the book.
        #[arg(long)]
        book: String,

        /// Borrowing user.
        #[arg(long)]
        user: String,
    },

    /// Move a loan to a new status.
    Advance {
        /// MASTER document id.
        #[arg(long)]
        master: String,

        /// Acting user.
        #[arg(long)]
        user: String,

        /// Workflow: BORROW, RENEW or RETURN.
        #[arg(long, default_value = "BORROW")]
        workflow: WorkflowType,

        /// Target status code, e.g. C, KC, D.
        #[arg(long)]
        status: Status,

        /// Copy handed over, at keeper confirmation.
        #[arg(long)]
        copy: Option<String>,

        /// Go back to the status the loan came from.
        #[arg(long)]
        backward: bool,
    },

    /// Cancel a loan.
    Cancel {
        /// MASTER document id.
        #[arg(long)]
        master: String,

        /// Acting user.
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "booklend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let api_url = cli.api_url.trim_end_matches('/');

    match cli.command {
        Commands::Daemon {
            bind,
            config,
            data_dir,
        } => {
            run_daemon(&bind, config, data_dir).await?;
        }

        Commands::Status => {
            show_status(&client, api_url).await?;
        }

        Commands::Upload { file } => {
            upload_books(&client, api_url, &file).await?;
        }

        Commands::Borrow { book, user } => {
            let body = serde_json::json!({ "book_post_id": book, "borrower_user": user });
            let started = send(client.post(format!("{}/api/v1/borrow", api_url)).json(&body)).await?;

            println!("Loan started");
            println!("Master:    {}", started["master_id"]);
            println!("Match:     {}", started["match_id"]);
            println!("Libworker: {}", started["libworker_user"]);
        }

        Commands::Advance {
            master,
            user,
            workflow,
            status,
            copy,
            backward,
        } => {
            let body = serde_json::json!({
                "master_id": master,
                "act_user": user,
                "workflow": workflow,
                "status": status,
                "chosen_copy_id": copy,
                "backward": backward,
            });
            let outcome = send(client.post(format!("{}/api/v1/workflow", api_url)).json(&body)).await?;

            println!("Status:   {}", outcome["status"]);
            println!("Written:  {}", outcome["written"]);
            println!("Notified: {}", outcome["notified"]);
            if let Some(failures) = outcome["notify_failures"].as_array() {
                for failure in failures {
                    println!("  not notified: {}", failure);
                }
            }
        }

        Commands::Cancel { master, user } => {
            let url = format!("{}/api/v1/workflow/{}", api_url, master);
            let outcome = send(client.delete(url).query(&[("act_user", user)])).await?;

            println!("Cancelled {} ({} documents deleted)", master, outcome["deleted"]);
        }
    }

    Ok(())
}

/// Run the API daemon.
async fn run_daemon(bind: &str, config: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting booklend daemon...");

    let mut config = match config {
        Some(path) => NodeConfig::load(&path)?,
        None => NodeConfig::default(),
    };
    if let Some(dir) = data_dir {
        config = config.with_data_dir(dir);
    }

    let node = LendingNode::new(config)?;
    let state = Arc::new(ApiState::new(node));

    api::serve(state, bind).await?;

    Ok(())
}

/// Show daemon status via API.
async fn show_status(client: &reqwest::Client, api_url: &str) -> Result<()> {
    let status = send(client.get(format!("{}/api/v1/status", api_url))).await?;
    let rules = send(client.get(format!("{}/api/v1/config", api_url))).await?;

    println!("Booklend Status");
    println!("===============");
    println!("Status:       {}", status["status"]);
    println!("Version:      {}", status["version"]);
    println!("Uptime:       {}s", status["uptime_secs"]);
    println!("Borrow limit: {}", rules["borrow_limit"]);
    println!("Max renewals: {}", rules["max_renew_times"]);
    println!("Loan days:    {}", rules["expired_days"]);

    Ok(())
}

/// Upload books from a JSON file via API.
async fn upload_books(client: &reqwest::Client, api_url: &str, file: &std::path::Path) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let books: Vec<BookUpload> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;

    let results = send(client.post(format!("{}/api/v1/books/upload", api_url)).json(&books)).await?;

    let Some(results) = results.as_object() else {
        anyhow::bail!("Unexpected upload response: {}", results);
    };

    println!("{:<20} {:<8} {:<20} {}", "BOOK", "STATUS", "POST ID", "MESSAGE");
    println!("{}", "-".repeat(72));

    for (book_id, result) in results {
        println!(
            "{:<20} {:<8} {:<20} {}",
            book_id,
            result["status"].as_str().unwrap_or("?"),
            result["post_id"].as_str().unwrap_or(""),
            result["message"].as_str().unwrap_or("")
        );
    }

    Ok(())
}

/// Send a request and decode the JSON body, failing on non-2xx.
async fn send(request: reqwest::RequestBuilder) -> Result<serde_json::Value> {
    let response = request.send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await?;
        anyhow::bail!("Request failed ({}): {}", status, error_text);
    }

    Ok(response.json().await?)
}
