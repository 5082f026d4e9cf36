//! toolmesh CLI: inspect tool providers, call tools and run workflows.
//!
//! Every command builds its components from the config file, does its work
//! and shuts them down again; nothing outlives the process.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use toolmesh_cli::commands;

/// toolmesh: drive tool providers over JSON-RPC and compose them into workflows
#[derive(Parser)]
#[command(name = "toolmesh", version, about = "Drive tool providers and run workflows")]
pub struct Cli {
    /// Path to the config file (YAML or JSON)
    #[arg(long, env = "TOOLMESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect configured providers and their tools
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },

    /// Call a single tool
    Call {
        /// Provider name from the config
        #[arg(long)]
        provider: String,
        /// Tool name
        #[arg(long)]
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Run or validate workflow files
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum ToolsAction {
    /// List tools across connected providers
    List {
        /// Only show this provider
        #[arg(long)]
        provider: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
        /// Read the discovery cache instead of starting providers
        #[arg(long)]
        cached: bool,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Run a workflow file
    Run {
        /// Path to the workflow YAML/JSON file
        file: String,
        /// Workflow input as key=value (repeatable, values may be JSON)
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Do not prompt for human_input steps
        #[arg(long)]
        no_input: bool,
        /// Print each step's result
        #[arg(short, long)]
        verbose: bool,
    },
    /// Validate a workflow file without running it
    Validate {
        /// Path to the workflow YAML/JSON file
        file: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "toolmesh_core=warn,toolmesh_cli=info".into()),
        )
        .init();

    let explicit = cli.config.is_some();
    let config_path = cli.config.unwrap_or_else(commands::default_config_path);

    let result = if let Some(command) = cli.command {
        match command {
            Commands::Tools { action } => match action {
                ToolsAction::List {
                    provider,
                    json,
                    cached,
                } => match commands::load_config(&config_path, explicit) {
                    Ok(config) if cached => {
                        commands::tools::list_cached(&config, provider.as_deref(), json)
                    }
                    Ok(config) => commands::tools::list(&config, provider.as_deref(), json).await,
                    Err(e) => Err(e),
                },
            },

            Commands::Call {
                provider,
                tool,
                args,
            } => match commands::load_config(&config_path, explicit) {
                Ok(config) => commands::call::run(&config, &provider, &tool, &args).await,
                Err(e) => Err(e),
            },

            Commands::Workflow { action } => match action {
                WorkflowAction::Run {
                    file,
                    inputs,
                    no_input,
                    verbose,
                } => match commands::load_config(&config_path, explicit) {
                    Ok(config) => {
                        commands::workflow::run(&config, &file, &inputs, !no_input, verbose).await
                    }
                    Err(e) => Err(e),
                },
                WorkflowAction::Validate { file } => commands::workflow::validate(&file).await,
            },
        }
    } else {
        // No subcommand: show help
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        Ok(())
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
