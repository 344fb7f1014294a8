//! Conductor CLI
//!
//! Command-line client for the Conductor admin API:
//! - Run queries
//! - Inspect and cancel queue jobs
//! - List and refresh pre-aggregations
//! - Check status

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "conductor-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Admin client for the Conductor query orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API server URL
    #[arg(long, default_value = "http://localhost:4010", global = true)]
    pub api_url: String,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a query and print its rows
    Load {
        /// SQL text
        sql: String,
        /// Data source to run against
        #[arg(short, long, default_value = "default")]
        data_source: String,
        /// Recompute even if a cached result is fresh
        #[arg(long)]
        renew: bool,
        /// Answer from these pre-aggregations
        #[arg(short, long)]
        pre_aggregation: Vec<String>,
    },

    /// List live queue jobs
    Queue {
        /// Only jobs of this data source
        #[arg(short, long)]
        data_source: Option<String>,
    },

    /// Show where the job for a fingerprint is
    Stage {
        fingerprint: String,
    },

    /// Cancel the job for a fingerprint
    Cancel {
        fingerprint: String,
    },

    /// Run one queue maintenance pass
    Maintenance,

    /// List pre-aggregations
    PreAggs,

    /// List the planned partitions of a pre-aggregation
    Partitions {
        name: String,
    },

    /// Refresh a pre-aggregation now
    Refresh {
        name: String,
    },

    /// List the builds of a pre-aggregation
    Versions {
        name: String,
    },

    /// Show server health
    Status,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let api = |path: &str| format!("{}/api/v1{}", cli.api_url, path);

    match &cli.command {
        Commands::Load {
            sql,
            data_source,
            renew,
            pre_aggregation,
        } => {
            let mut body = serde_json::json!({
                "sql": sql,
                "data_source": data_source,
                "renew_query": renew,
                "pre_aggregations": pre_aggregation,
            });

            // Poll until the query finishes; only the first request renews
            let data = loop {
                let response = client.post(api("/load")).json(&body).send().await?;
                let status = response.status();
                if status == reqwest::StatusCode::ACCEPTED {
                    body["renew_query"] = Value::Bool(false);
                    eprintln!("Query still running...");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    eprintln!("Query failed ({}): {}", status, text);
                    std::process::exit(1);
                }
                break response.json::<Value>().await?;
            };

            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&data)?),
                _ => {
                    print_rows(&data["data"]);
                    if data["from_cache"].as_bool() == Some(true) {
                        println!();
                        println!(
                            "(cached, last refreshed {})",
                            data["last_refresh_time"].as_str().unwrap_or("-")
                        );
                    }
                }
            }
        }

        Commands::Queue { data_source } => {
            let mut request = client.get(api("/queue"));
            if let Some(data_source) = data_source {
                request = request.query(&[("data_source", data_source)]);
            }
            let data = fetch(request).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&data)?);
                return Ok(());
            }

            let jobs = data["jobs"].as_array().cloned().unwrap_or_default();
            if jobs.is_empty() {
                println!("Queue is empty.");
            } else {
                println!(
                    "{:<16} {:<12} {:<10} {:>8} {:>8}",
                    "Fingerprint", "Data source", "Status", "Priority", "Attempts"
                );
                println!("{}", "-".repeat(58));
                for job in jobs {
                    println!(
                        "{:<16} {:<12} {:<10} {:>8} {:>8}",
                        job["fingerprint"].as_str().map(short).unwrap_or("-"),
                        job["data_source"].as_str().unwrap_or("-"),
                        job["status"].as_str().unwrap_or("-"),
                        job["priority"].as_i64().unwrap_or(0),
                        job["attempts"].as_u64().unwrap_or(0)
                    );
                }
            }
        }

        Commands::Stage { fingerprint } => {
            let data = fetch(client.get(api(&format!("/queue/{}", fingerprint)))).await?;
            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&data)?),
                _ => println!("{}", data["description"].as_str().unwrap_or("unknown")),
            }
        }

        Commands::Cancel { fingerprint } => {
            let response = client
                .delete(api(&format!("/queue/{}", fingerprint)))
                .send()
                .await?;
            if response.status().is_success() {
                println!("Cancelled {}", short(fingerprint));
            } else {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                eprintln!("Cancel failed ({}): {}", status, text);
                std::process::exit(1);
            }
        }

        Commands::Maintenance => {
            let data = fetch(client.post(api("/queue/maintenance"))).await?;
            println!(
                "Requeued {} stalled, failed {}, cancelled {} orphaned",
                data["requeued"].as_u64().unwrap_or(0),
                data["failed"].as_u64().unwrap_or(0),
                data["orphaned"].as_u64().unwrap_or(0)
            );
        }

        Commands::PreAggs => {
            let data = fetch(client.get(api("/pre-aggregations"))).await?;
            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&data)?);
                return Ok(());
            }

            let items = data["pre_aggregations"].as_array().cloned().unwrap_or_default();
            if items.is_empty() {
                println!("No pre-aggregations defined.");
            } else {
                println!(
                    "{:<24} {:<24} {:<12} {:<8}",
                    "Name", "Table", "Data source", "Grain"
                );
                println!("{}", "-".repeat(70));
                for item in items {
                    println!(
                        "{:<24} {:<24} {:<12} {:<8}",
                        item["name"].as_str().unwrap_or("-"),
                        item["table_name"].as_str().unwrap_or("-"),
                        item["data_source"].as_str().unwrap_or("-"),
                        item["granularity"].as_str().unwrap_or("-")
                    );
                }
            }
        }

        Commands::Partitions { name } => {
            let data =
                fetch(client.get(api(&format!("/pre-aggregations/{}/partitions", name)))).await?;
            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&data)?);
                return Ok(());
            }

            println!("{:<28} {:<22} {:<10} {}", "Partition", "Start", "Immutable", "Built as");
            println!("{}", "-".repeat(90));
            for partition in data["partitions"].as_array().cloned().unwrap_or_default() {
                println!(
                    "{:<28} {:<22} {:<10} {}",
                    partition["table_name"].as_str().unwrap_or("-"),
                    partition["range_start"].as_str().unwrap_or("-"),
                    partition["immutable"].as_bool().unwrap_or(false),
                    partition["target_table"].as_str().unwrap_or("(not built)")
                );
            }
        }

        Commands::Refresh { name } => {
            let data =
                fetch(client.post(api(&format!("/pre-aggregations/{}/refresh", name)))).await?;
            let refreshed = data["refreshed"].as_array().map(Vec::len).unwrap_or(0);
            let failed = data["failed"].as_array().cloned().unwrap_or_default();
            println!(
                "Refreshed {} of {} partitions",
                refreshed,
                data["partitions"].as_u64().unwrap_or(0)
            );
            for failure in failed {
                println!(
                    "  {}: {}",
                    failure[0].as_str().unwrap_or("-"),
                    failure[1].as_str().unwrap_or("-")
                );
            }
        }

        Commands::Versions { name } => {
            let data =
                fetch(client.get(api(&format!("/pre-aggregations/{}/versions", name)))).await?;
            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&data)?);
                return Ok(());
            }

            println!("{:<28} {:<10} {:<10} {}", "Partition", "Content", "Structure", "Updated");
            println!("{}", "-".repeat(80));
            for version in data["versions"].as_array().cloned().unwrap_or_default() {
                println!(
                    "{:<28} {:<10} {:<10} {}",
                    version["table_name"].as_str().unwrap_or("-"),
                    version["content_version"].as_str().unwrap_or("-"),
                    version["structure_version"].as_str().unwrap_or("-"),
                    version["last_updated_at"].as_str().unwrap_or("-")
                );
            }
        }

        Commands::Status => {
            let response = client
                .get(format!("{}/health", cli.api_url))
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let health: Value = resp.json().await?;

                    println!("Conductor v{}", env!("CARGO_PKG_VERSION"));
                    println!();
                    println!("Status: {}", health["status"].as_str().unwrap_or("unknown"));
                    println!(
                        "Store:  {} ({})",
                        health["store"].as_str().unwrap_or("unknown"),
                        health["store_backend"].as_str().unwrap_or("-")
                    );

                    if let Some(sources) = health["data_sources"].as_object() {
                        println!();
                        println!("Data sources:");
                        for (name, status) in sources {
                            println!("  {}: {}", name, status.as_str().unwrap_or("-"));
                        }
                    }

                    if let Some(uptime) = health["uptime_seconds"].as_u64() {
                        println!();
                        println!("Uptime: {}", format_duration(uptime));
                    }
                }
                Err(e) => {
                    eprintln!("Cannot connect to Conductor API at {}", cli.api_url);
                    eprintln!("Error: {}", e);
                    eprintln!();
                    eprintln!("Make sure the Conductor server is running:");
                    eprintln!("  cargo run --bin conductor");
                    std::process::exit(1);
                }
            }
        }

        Commands::Config { output } => {
            let config = conductor::config::generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

/// Send a request and return its JSON body, exiting on an error status
async fn fetch(request: reqwest::RequestBuilder) -> Result<Value, Box<dyn std::error::Error>> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        eprintln!("Request failed ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(response.json().await?)
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..16).unwrap_or(fingerprint)
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}

fn print_rows(rows: &Value) {
    let rows = match rows.as_array() {
        Some(rows) if !rows.is_empty() => rows,
        _ => {
            println!("No rows");
            return;
        }
    };

    let columns: Vec<String> = rows[0]
        .as_object()
        .map(|row| row.keys().cloned().collect())
        .unwrap_or_default();

    println!(
        "{}",
        columns
            .iter()
            .map(|c| format!("{:<14}", c))
            .collect::<Vec<_>>()
            .join(" | ")
    );
    println!("{}", "-".repeat(columns.len() * 17));

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| match &row[c] {
                Value::Null => format!("{:<14}", "-"),
                Value::String(s) => format!("{:<14}", s),
                other => format!("{:<14}", other),
            })
            .collect();
        println!("{}", cells.join(" | "));
    }
}
