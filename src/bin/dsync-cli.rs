use clap::{Parser, Subcommand};
use dsync::constants::network::DEFAULT_PREFIX;
use dsync::{EmitOptions, FanoutMode, NodeOptions, PeerOutcome, SyncNode};
use reqwest::Client;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dsync-cli")]
#[command(about = "dsync CLI - emit events to peers and inspect nodes", long_about = None)]
struct Args {
    /// Endpoint prefix shared by the mesh
    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Output compact JSON (single line)
    #[arg(long)]
    compact: bool,

    /// Output human-readable format
    #[arg(long)]
    human: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "lowercase")]
enum Commands {
    /// Emit an event to one or more peers
    Emit {
        /// Event name
        event: String,

        /// Payload as a JSON object
        #[arg(default_value = "{}")]
        payload: String,

        /// Peer URL, may be repeated
        #[arg(long = "peer", required = true)]
        peers: Vec<String>,

        /// Address to send as the event source instead of "self"
        #[arg(long)]
        source: Option<String>,

        /// Send to all peers at once
        #[arg(long)]
        concurrent: bool,

        /// Skip the adaptive pre-send delay
        #[arg(long)]
        no_delay: bool,
    },

    /// Show a node's status
    Status {
        /// Node base URL
        #[arg(long, default_value = "http://127.0.0.1:24180")]
        node: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run_command(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_command(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_secs(args.timeout);

    match &args.command {
        Commands::Emit {
            event,
            payload,
            peers,
            source,
            concurrent,
            no_delay,
        } => {
            let payload: Map<String, Value> = match serde_json::from_str::<Value>(payload)? {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                _ => return Err("payload must be a JSON object".into()),
            };

            let options = NodeOptions {
                name: "dsync-cli".to_string(),
                advertise_address: source.clone(),
                fanout: if *concurrent {
                    FanoutMode::Concurrent
                } else {
                    FanoutMode::Sequential
                },
                fixed_delay: no_delay.then_some(Duration::ZERO),
                ..NodeOptions::default()
            };
            let node = SyncNode::with_http(&args.prefix, options, Some(timeout))?;
            for peer in peers {
                node.add_peer(peer);
            }

            let outcomes = node.emit(event, payload, EmitOptions::new()).await;
            if args.human {
                print_outcomes(&outcomes);
            } else {
                print_json(&serde_json::to_value(&outcomes)?, args.compact)?;
            }
        }
        Commands::Status { node } => {
            let url = format!(
                "{}/{}/status",
                node.trim_end_matches('/'),
                args.prefix.trim_matches('/')
            );
            let response = Client::builder()
                .timeout(timeout)
                .build()?
                .get(&url)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(format!("HTTP error: {}", response.status()).into());
            }
            let status: Value = response.json().await?;

            if args.human {
                print_status(&status);
            } else {
                print_json(&status, args.compact)?;
            }
        }
    }

    Ok(())
}

fn print_json(value: &Value, compact: bool) -> Result<(), serde_json::Error> {
    if compact {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

fn print_outcomes(outcomes: &[PeerOutcome]) {
    println!("Delivery:");
    for outcome in outcomes {
        match (outcome.data(), outcome.error()) {
            (_, Some(error)) => println!("  ❌ {:<32} {}", outcome.peer, error),
            (Some(data), None) => println!("  ✅ {:<32} {}", outcome.peer, data),
            (None, None) => println!("  ✅ {:<32} (no response body)", outcome.peer),
        }
    }
    let delivered = outcomes.iter().filter(|o| o.is_delivered()).count();
    println!("  {}/{} peer(s) reached", delivered, outcomes.len());
}

fn print_status(status: &Value) {
    println!("Node Status:");
    println!(
        "  Node:           {}",
        status.get("node").and_then(|v| v.as_str()).unwrap_or("N/A")
    );
    println!(
        "  Prefix:         /{}",
        status.get("prefix").and_then(|v| v.as_str()).unwrap_or("")
    );
    println!(
        "  Ledger entries: {}",
        status
            .get("ledgerEntries")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    );
    println!(
        "  Handlers:       {}",
        status.get("handlers").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    if let Some(peers) = status.get("peers").and_then(|v| v.as_array()) {
        println!("  Peers ({}):", peers.len());
        for peer in peers {
            println!("    {}", peer.as_str().unwrap_or("?"));
        }
    }
}
