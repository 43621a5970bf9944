//! Circuit Script Admin CLI
//!
//! Talks to a running server over HTTP: registers circuits, sends events,
//! runs circuits by name and browses execution history.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Parser)]
#[command(name = "circuit-admin")]
#[command(about = "Circuit Script Admin CLI - manage circuits and inspect runs")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server base URL
    #[arg(long, env = "CIRCUIT_URL", default_value = "http://localhost:4000")]
    url: String,

    /// API key sent as a bearer token
    #[arg(long, env = "CIRCUIT_API_KEY")]
    api_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health
    Health,

    /// Circuit management
    Circuits {
        #[command(subcommand)]
        action: CircuitCommands,
    },

    /// Event dispatch
    Events {
        #[command(subcommand)]
        action: EventCommands,
    },

    /// Run one circuit by name, ignoring its triggers
    Execute {
        /// Circuit name
        name: String,

        /// JSON file holding a trigger event or a bare payload
        file: PathBuf,

        /// Circuit version; the highest registered when omitted
        #[arg(long)]
        version: Option<u32>,
    },

    /// Browse execution history
    Executions {
        /// Maximum number of records
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Only records of this circuit
        #[arg(long)]
        circuit: Option<String>,

        /// Only records with this status (ok, failed, partial, compensated, cancelled)
        #[arg(long)]
        status: Option<String>,

        /// Print full JSON records
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CircuitCommands {
    /// List registered circuits
    List,

    /// Register a circuit from a JSON definition file
    Create { file: PathBuf },
}

#[derive(Subcommand)]
enum EventCommands {
    /// Dispatch a trigger event from a JSON file
    Send { file: PathBuf },
}

struct AdminClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AdminClient {
    fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self
            .request(self.client.get(&url).query(query))
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        Self::read(response).await
    }

    async fn post(&self, path: &str, query: &[(&str, String)], body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let response = self
            .request(self.client.post(&url).query(query).json(body))
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        Self::read(response).await
    }

    async fn read(response: Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let kind = body["error"]["kind"].as_str().unwrap_or("error");
            let message = body["error"]["message"].as_str().unwrap_or("no details");
            bail!("{} ({}): {}", status, kind, message);
        }
        Ok(body)
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn colored_status(status: &str) -> ColoredString {
    match status {
        "ok" => status.green(),
        "partial" | "compensated" => status.yellow(),
        "cancelled" => status.cyan(),
        _ => status.red(),
    }
}

fn print_records(records: &Value) {
    let records = match records.as_array() {
        Some(records) if !records.is_empty() => records,
        _ => {
            println!("{}", "No runs".yellow());
            return;
        }
    };

    for record in records {
        println!(
            "{} v{} [{}] {} in {}ms",
            record["circuit"].as_str().unwrap_or("?").bold(),
            record["version"],
            colored_status(record["status"].as_str().unwrap_or("?")),
            record["correlation_id"].as_str().unwrap_or("").dimmed(),
            record["duration_ms"],
        );
        if let Some(error) = record["error"].as_str() {
            println!("  {}", error.red());
        }
        for action in record["actions"].as_array().into_iter().flatten() {
            let outcome = action["outcome"].as_str().unwrap_or("?");
            let detail = action["message"]
                .as_str()
                .or_else(|| action["reason"].as_str())
                .unwrap_or("");
            println!(
                "  - {:<24} {:<12} {}",
                action["name"].as_str().unwrap_or("?"),
                match outcome {
                    "ok" => outcome.green(),
                    "skipped" => outcome.dimmed(),
                    _ => outcome.red(),
                },
                detail
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let client = AdminClient::new(&cli.url, cli.api_key.clone());

    match cli.command {
        Commands::Health => {
            let health = client.get("/health", &[]).await?;
            println!("{}", "Server Status:".green().bold());
            println!("  Status: {}", health["status"].as_str().unwrap_or("?").green());
            println!("  Version: {}", health["version"].as_str().unwrap_or("?"));
            println!("  Circuits: {}", health["circuits"]);
            println!("  Executions in history: {}", health["executions"]);
        }

        Commands::Circuits { action } => match action {
            CircuitCommands::List => {
                let circuits = client.get("/circuits", &[]).await?;
                let circuits = circuits.as_array().cloned().unwrap_or_default();
                if circuits.is_empty() {
                    println!("{}", "No circuits registered".yellow());
                }
                for circuit in circuits {
                    println!(
                        "{} v{} ({})",
                        circuit["name"].as_str().unwrap_or("?").bold(),
                        circuit["version"],
                        circuit["on_failure"].as_str().unwrap_or("abort"),
                    );
                    if let Some(description) = circuit["description"].as_str() {
                        println!("  {}", description.dimmed());
                    }
                    let steps: Vec<&str> = circuit["steps"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(Value::as_str)
                        .collect();
                    println!("  steps: {}", steps.join(" → "));
                }
            }
            CircuitCommands::Create { file } => {
                let definition = read_json(&file)?;
                let summary = client.post("/circuits", &[], &definition).await?;
                println!(
                    "{} {} v{}",
                    "Registered".green(),
                    summary["name"].as_str().unwrap_or("?").bold(),
                    summary["version"]
                );
            }
        },

        Commands::Events { action } => match action {
            EventCommands::Send { file } => {
                let event = read_json(&file)?;
                let records = client.post("/events", &[], &event).await?;
                print_records(&records);
            }
        },

        Commands::Execute {
            name,
            file,
            version,
        } => {
            let body = read_json(&file)?;
            let query: Vec<(&str, String)> = version
                .map(|v| vec![("version", v.to_string())])
                .unwrap_or_default();
            let records = client
                .post(&format!("/circuits/{}/execute", name), &query, &body)
                .await?;
            print_records(&records);
        }

        Commands::Executions {
            limit,
            circuit,
            status,
            json,
        } => {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(circuit) = circuit {
                query.push(("circuit_name", circuit));
            }
            if let Some(status) = status {
                query.push(("status", status));
            }
            let records = client.get("/executions", &query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        }
    }

    Ok(())
}
