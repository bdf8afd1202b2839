use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use mcp_host::config::HostSettings;
use mcp_host::logging::LogFormat;
use mcp_host::mcp::is_placeholder_command;
use mcp_host::security::SecurityPolicy;
use mcp_host::tools::ToolOrigin;
use mcp_host::{McpHost, ToolOutcome};

#[derive(Parser)]
#[command(name = "mcp-host")]
#[command(about = "Supervise MCP capability servers and call their tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: nearest .mcp-host.toml, then ~/.config/mcp-host/)
    #[arg(long, global = true, env = "MCP_HOST_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log format on stderr
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, ignore_case = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Start enabled servers and show their status
    Servers {
        /// Print statuses as JSON
        #[arg(long)]
        json: bool,
    },
    /// List built-in tools and tools of enabled servers
    Tools {
        /// Only list tools from a specific server ("builtin" for built-ins)
        #[arg(long)]
        server: Option<String>,
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call a tool by id (`server:tool` or a built-in name)
    Call {
        /// Tool id
        tool: String,
        /// Arguments as JSON
        #[arg(long, short)]
        args: Option<String>,
        /// Timeout in seconds (clamped to the security maximum)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Validate every configured server without starting it
    Validate,
    /// Print the effective security configuration
    Security,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    mcp_host::logging::init_tracing(cli.verbose, cli.log_format)?;

    let (path, settings) = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Servers { json } => run_servers(settings, path, json).await?,
        Commands::Tools { server, json } => run_tools(settings, server, json).await?,
        Commands::Call { tool, args, timeout } => {
            let ok = run_call(settings, &tool, args, timeout).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Validate => {
            if !run_validate(&settings) {
                std::process::exit(1);
            }
        }
        Commands::Security => {
            print!(
                "{}",
                toml::to_string_pretty(&settings.security).context("Failed to render security config")?
            );
        }
    }

    Ok(())
}

fn load_settings(explicit: Option<&std::path::Path>) -> Result<(Option<PathBuf>, HostSettings)> {
    if let Some(path) = explicit {
        let settings = HostSettings::load_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        return Ok((Some(path.to_path_buf()), settings));
    }

    match HostSettings::load().context("Failed to load settings")? {
        Some((path, settings)) => Ok((Some(path), settings)),
        None => {
            tracing::info!("No settings file found, using defaults");
            Ok((None, HostSettings::default()))
        }
    }
}

fn build_host(settings: HostSettings) -> McpHost {
    let (host, rejected) = McpHost::new(settings);
    for (name, e) in rejected {
        eprintln!("Skipping server '{}': {}", name, e);
    }
    host
}

async fn run_servers(settings: HostSettings, path: Option<PathBuf>, json: bool) -> Result<()> {
    let host = build_host(settings);
    if let Some(path) = path {
        host.persist_to(path);
    }

    for (name, e) in host.manager().start_all_enabled_servers().await {
        eprintln!("Failed to start '{}': {}", name, e);
    }

    let statuses = host.manager().get_all_server_statuses();
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else if statuses.is_empty() {
        println!("No servers configured.");
    } else {
        println!("{:<20} {:<10} {:>6}  ERROR", "SERVER", "STATE", "TOOLS");
        for status in &statuses {
            println!(
                "{:<20} {:<10} {:>6}  {}",
                status.name,
                status.state,
                status.discovered_tools.len(),
                status.last_error.as_deref().unwrap_or("")
            );
        }
        let stats = host.manager().get_server_statistics();
        println!();
        println!(
            "{} servers: {} enabled, {} running, {} stopped, {} error",
            stats.total, stats.enabled, stats.running, stats.stopped, stats.error
        );
    }

    host.shutdown().await;
    Ok(())
}

async fn run_tools(settings: HostSettings, server: Option<String>, json: bool) -> Result<()> {
    let host = build_host(settings);

    match server.as_deref() {
        None => {
            for (name, e) in host.manager().start_all_enabled_servers().await {
                eprintln!("Failed to start '{}': {}", name, e);
            }
        }
        Some("builtin") => {}
        Some(name) => {
            host.manager()
                .start_server(name)
                .await
                .with_context(|| format!("Failed to start '{}'", name))?;
        }
    }

    let tools: Vec<_> = host
        .tools()
        .await
        .into_iter()
        .filter(|t| match server.as_deref() {
            None => true,
            Some("builtin") => t.origin == ToolOrigin::BuiltIn,
            Some(name) => t.source_server.as_deref() == Some(name),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        println!("Available tools ({}):\n", tools.len());
        for tool in &tools {
            println!("  {}", tool.id);
            if !tool.description.is_empty() {
                println!("    {}", tool.description);
            }
        }
    }

    host.shutdown().await;
    Ok(())
}

async fn run_call(settings: HostSettings, tool: &str, args: Option<String>, timeout: Option<u64>) -> Result<bool> {
    let args: Value = match args {
        Some(s) => serde_json::from_str(&s).context("Invalid JSON arguments")?,
        None => Value::Object(Default::default()),
    };

    let host = build_host(settings);
    if let Some((server, _)) = tool.split_once(':') {
        host.manager()
            .start_server(server)
            .await
            .with_context(|| format!("Failed to start '{}'", server))?;
    }

    let outcome = host
        .call_tool(tool, args, timeout.map(Duration::from_secs))
        .await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    host.shutdown().await;
    Ok(matches!(outcome, ToolOutcome::Success { .. }))
}

fn run_validate(settings: &HostSettings) -> bool {
    let security = SecurityPolicy::new(settings.security.clone());
    let mut all_valid = true;

    if settings.servers.is_empty() {
        println!("No servers configured.");
    }
    for server in &settings.servers {
        let mut result = security.validate_server_config(server);
        if is_placeholder_command(&server.command) {
            result.error(format!(
                "Command '{}' is a placeholder and cannot speak MCP",
                server.command
            ));
        }

        println!("{}: {}", server.name, if result.valid { "ok" } else { "INVALID" });
        for error in &result.errors {
            println!("  error: {}", error);
        }
        for warning in &result.warnings {
            println!("  warning: {}", warning);
        }
        all_valid &= result.valid;
    }

    all_valid
}
