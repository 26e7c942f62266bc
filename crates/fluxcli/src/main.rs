use anyhow::Result;
use clap::{Parser, Subcommand};
use fluxcore::{EventSink, Flow, NodeSpec, RunEventKind};
use fluxruntime::{FlowExecutor, MemoryCache, NodeRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flux")]
#[command(about = "Flux execution engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file locally
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, verbose } => {
            let level = if verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::WARN
            };
            tracing_subscriber::fmt().with_max_level(level).init();

            run_flow(file).await?;
        }

        Commands::Validate { file } => {
            validate_flow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_flow(output)?;
        }
    }

    Ok(())
}

fn build_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    fluxnodes::register_all(&mut registry);
    registry
}

async fn run_flow(file: PathBuf) -> Result<()> {
    let flow_json = std::fs::read_to_string(&file)?;
    let flow: Flow = serde_json::from_str(&flow_json)?;

    println!("flow: {} ({} nodes, {} connections)", flow.name, flow.nodes.len(), flow.connections.len());

    let registry = build_registry();
    flow.validate(|node_type| registry.contains(node_type))?;

    let executor = FlowExecutor::new(Arc::new(MemoryCache::new()));
    let run_id = Uuid::new_v4();
    let (tx, mut rx) = broadcast::channel(1024);
    let sink = EventSink::new(run_id, tx);
    let cancel = CancellationToken::new();

    // Ctrl-C requests cooperative cancellation; the executor stops
    // scheduling new nodes and emits a cancelled end event.
    let ctrlc_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested");
            ctrlc_cancel.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    match event.kind {
                        RunEventKind::Data { node_id, port, payload } => {
                            println!("  [{}] {} = {:?}", node_id, port, payload);
                        }
                        RunEventKind::Error { message } => {
                            println!("run failed: {}", message);
                        }
                        RunEventKind::End { cancelled } => {
                            if cancelled {
                                println!("run cancelled");
                            } else {
                                println!("run completed");
                            }
                        }
                    }
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let result = executor.execute(&flow, &registry, &sink, cancel).await;
    match &result {
        Ok(outcome) if outcome.cancelled => {
            sink.end(true);
        }
        Ok(outcome) => {
            sink.end(false);
            println!("nodes executed: {}", outcome.nodes_executed);
            let output = outcome.final_output(&flow);
            println!("output: {}", serde_json::to_string_pretty(&output)?);
        }
        Err(e) => {
            sink.error(e.to_string());
        }
    }

    drop(sink);
    let _ = printer.await;
    result?;
    Ok(())
}

fn validate_flow(file: PathBuf) -> Result<()> {
    let flow_json = std::fs::read_to_string(&file)?;
    let flow: Flow = serde_json::from_str(&flow_json)?;

    let registry = build_registry();
    flow.validate(|node_type| registry.contains(node_type))?;

    println!("flow is valid:");
    println!("  name: {}", flow.name);
    println!("  nodes: {}", flow.nodes.len());
    println!("  connections: {}", flow.connections.len());
    Ok(())
}

fn list_nodes() {
    let registry = build_registry();
    println!("available node types:");
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  {}", node_type);
        }
    }
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let mut flow = Flow::new("example");
    flow.description = Some("Parses a JSON document and logs the result".to_string());

    let emit = NodeSpec::new("debug.log")
        .with_name("Emit")
        .with_config("message", r#"{"greeting": "hello"}"#);
    let parse = NodeSpec::new("transform.json_parse").with_name("Parse");

    let emit_id = flow.add_node(emit);
    let parse_id = flow.add_node(parse);
    flow.connect(emit_id, "message", parse_id, "json");

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(&output, json)?;

    println!("created example flow: {}", output.display());
    println!("run it with: flux run --file {}", output.display());
    Ok(())
}
