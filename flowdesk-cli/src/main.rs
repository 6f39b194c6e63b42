//! FlowDesk command-line smoke tool.
//!
//! Wires the in-memory collaborators behind `ProcessService`.
//!
//! # Usage
//!
//! ```bash
//! # Deploy a definition file or a .tar.gz bundle of definitions
//! flowdesk deploy leave.bpmn20.xml --name "Leave"
//!
//! # Render a definition's diagram, highlighting some activities
//! flowdesk render leave.bpmn20.xml --highlight start,submit --out leave.svg
//!
//! # Publish the built-in leave-request model and run it end to end
//! flowdesk demo
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use flowdesk_core::bpmn_xml::parse_definitions;
use flowdesk_core::{DiagramEncoder, FlowDeskConfig, ProcessService, SvgDiagramEncoder, Variables};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LEAVE_REQUEST_MODEL: &str = r#"{
  "nodes": [
    {"kind": "StartEvent", "id": "start", "name": "Request"},
    {"kind": "UserTask", "id": "submit", "name": "Submit request", "assignee": "${initiator}"},
    {"kind": "ExclusiveGateway", "id": "long_leave", "name": "More than 3 days?"},
    {"kind": "UserTask", "id": "approve", "name": "Manager approval", "candidateGroups": ["managers"]},
    {"kind": "EndEvent", "id": "done", "name": "Done"}
  ],
  "edges": [
    {"from": "start", "to": "submit"},
    {"from": "submit", "to": "long_leave"},
    {"from": "long_leave", "to": "approve", "condition": "${form.days > 3}"},
    {"from": "long_leave", "to": "done", "isDefault": true},
    {"from": "approve", "to": "done"}
  ]
}"#;

#[derive(Parser)]
#[command(name = "flowdesk")]
#[command(version)]
#[command(about = "Publish, run and render BPMN processes against an in-memory engine")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "FLOWDESK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a .bpmn / .bpmn20.xml / .xml file or a .tar.gz / .tgz archive
    Deploy {
        file: PathBuf,

        /// Deployment name (defaults to the file name without extension)
        #[arg(long)]
        name: Option<String>,
    },

    /// Render a definition file's diagram as SVG
    Render {
        file: PathBuf,

        /// Comma-separated activity ids to highlight
        #[arg(long, value_delimiter = ',')]
        highlight: Vec<String>,

        /// Output path (stdout if omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Publish the built-in leave-request model and run intake + approval
    Demo {
        /// Requested leave in days; more than 3 needs a manager's approval
        #[arg(long, default_value_t = 5)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowdesk=info,flowdesk_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            FlowDeskConfig::from_file(path)?
        }
        None => FlowDeskConfig::default(),
    };

    match cli.command {
        Commands::Deploy { file, name } => deploy(&config, &file, name.as_deref()).await,
        Commands::Render {
            file,
            highlight,
            out,
        } => render(&file, highlight, out.as_deref()),
        Commands::Demo { days } => demo(config, days).await,
    }
}

async fn deploy(config: &FlowDeskConfig, file: &Path, name: Option<&str>) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} is not a file", file.display()))?;

    let service = ProcessService::in_memory(config);
    let deployment = service.deploy(&file_name, &bytes, name).await?;
    println!("{}", serde_json::to_string_pretty(&deployment)?);
    Ok(())
}

fn render(file: &Path, highlight: Vec<String>, out: Option<&Path>) -> Result<()> {
    let xml = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let defs = parse_definitions(&xml).map_err(|e| anyhow!("{}: {}", file.display(), e))?;
    let process = defs
        .processes
        .first()
        .ok_or_else(|| anyhow!("{} holds no process", file.display()))?;
    let layout = defs.layout_for(process, &process.key);
    if !layout.has_geometry() {
        tracing::warn!(process = %process.key, "Definition has no diagram geometry; nothing to render");
        return Ok(());
    }

    let highlighted: BTreeSet<String> = highlight.into_iter().collect();
    let svg = SvgDiagramEncoder.encode(&layout, &highlighted)?;
    match out {
        Some(path) => {
            std::fs::write(path, &svg).with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), bytes = svg.len(), "Diagram written");
        }
        None => println!("{}", String::from_utf8_lossy(&svg)),
    }
    Ok(())
}

async fn demo(mut config: FlowDeskConfig, days: u32) -> Result<()> {
    config
        .identities
        .entry("bob".to_string())
        .or_insert_with(|| vec!["managers".to_string()]);
    let service = ProcessService::in_memory(&config);

    let model = service
        .create_model("Leave Request", "leave_request", "Built-in demo model")
        .await?;
    service
        .save_model_source(&model.id, LEAVE_REQUEST_MODEL.as_bytes().to_vec())
        .await?;
    let deployment = service.publish(&model.id).await?;
    let definition = deployment
        .definitions
        .first()
        .ok_or_else(|| anyhow!("publish produced no definition"))?;

    let mut form = Variables::new();
    form.insert("days".to_string(), days.into());
    let instance = service.start_process(&definition.id, "alice", &form).await?;

    for task in service.list_tasks("bob", 0, 0).await?.content {
        if task.process_instance_id == instance.id {
            service.handle_task("bob", &task.id).await?;
        }
    }

    let final_state = service.get_instance(&instance.id).await?;
    let tasks = service.instance_history(&instance.id).await?;
    let activities = service.activity_trace(&instance.id).await?;
    let report = serde_json::json!({
        "deployment": deployment,
        "instance": final_state,
        "tasks": tasks.as_slice(),
        "activities": activities.as_slice(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
