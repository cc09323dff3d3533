//! The `gantry` command-line launcher.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use gantry_core::{config::AppConfig, gateway::GatewayBuilder, plugin::PluginRegistry};
use std::{
    fs,
    io::Write,
    path::Path,
    process::ExitCode,
};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Pluggable API gateway/proxy system.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists available gantry plugins
    #[command(alias = "ls")]
    Plugins,

    /// Opens the documentation webpage for a plugin
    Doc {
        /// Plugin name, as shown by `gantry plugins`
        name: String,
    },

    /// Generates an example configuration with the specified plugins
    #[command(alias = "gen")]
    Generate {
        /// Plugin names to include
        names: Vec<String>,
    },

    /// Starts the API gateway using the specified config file
    Start {
        /// Location of the configuration file
        #[arg(short, long, default_value = "gantry.yaml")]
        config: String,

        /// Location of the PID file
        #[arg(short, long, default_value = "gantry.pid")]
        pidfile: String,
    },

    /// Checks a gantry config: parses it and initializes all plugins
    Check {
        /// Location of the configuration file
        #[arg(short, long, default_value = "gantry.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let registry = PluginRegistry::builtin();

    match cli.command {
        Commands::Plugins => list_plugins(&registry),
        Commands::Doc { name } => open_doc(&registry, &name),
        Commands::Generate { names } => generate_config(&registry, &names),
        Commands::Check { config } => check(&config).await,
        Commands::Start { config, pidfile } => start(&config, &pidfile).await,
    }
}

fn list_plugins(registry: &PluginRegistry) -> anyhow::Result<()> {
    println!("Available plugins:\n");
    let width = registry.iter().map(|info| info.name.len()).max().unwrap_or(0);
    for info in registry.iter() {
        println!("   {:width$}   {}", info.name, info.description);
    }
    println!();
    Ok(())
}

fn open_doc(registry: &PluginRegistry, name: &str) -> anyhow::Result<()> {
    let Some(info) = registry.get(name) else {
        bail!("Plugin '{name}' not found. Try 'gantry plugins' to list available ones.");
    };
    println!("Opening documentation for '{}' at: {}", info.name, info.link);
    open::that(info.link).with_context(|| format!("could not open '{}'", info.link))?;
    Ok(())
}

fn generate_config(registry: &PluginRegistry, names: &[String]) -> anyhow::Result<()> {
    let mut config = AppConfig::example();
    config.plugins = registry
        .example_entries(names)
        .context("couldn't generate configuration")?;
    let yaml = serde_yaml::to_string(&config).context("couldn't serialize configuration")?;
    print!("{yaml}");
    Ok(())
}

async fn check(config_path: &str) -> anyhow::Result<()> {
    let gateway = build_gateway(config_path).await?;
    gateway.shutdown();
    println!("All OK.");
    Ok(())
}

async fn start(config_path: &str, pidfile: &str) -> anyhow::Result<()> {
    if let Some(pid) = read_pidfile(pidfile)? {
        bail!(
            "There is already a pidfile at '{pidfile}' that appears to belong to a running \
             gantry instance (PID {pid}). If you know what you're doing, delete the file and \
             try again."
        );
    }

    let config = load_config(config_path)?;
    gantry_server::init_logging(&config.logging);

    let gateway = GatewayBuilder::new(config.clone()).build().await?;
    write_pidfile(pidfile)?;
    println!("Launching gantry on port {}.", config.serve.port);

    let result = gantry_server::serve(gateway, config.serve.port).await;
    remove_pidfile(pidfile);
    result
}

fn load_config(path: &str) -> anyhow::Result<AppConfig> {
    AppConfig::load(path).with_context(|| format!("couldn't load configuration from '{path}'"))
}

async fn build_gateway(
    config_path: &str,
) -> anyhow::Result<std::sync::Arc<gantry_core::gateway::Gateway>> {
    let config = load_config(config_path)?;
    GatewayBuilder::new(config)
        .build()
        .await
        .context("couldn't initialize the API gateway")
}

/// Reads a PID from an existing pidfile; `None` when the file is absent.
fn read_pidfile(path: &str) -> anyhow::Result<Option<u32>> {
    if !Path::new(path).exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("pidfile exists, but couldn't read it: {path}"))?;
    let pid = raw
        .trim()
        .parse::<u32>()
        .with_context(|| format!("pidfile PID is not an integer: {path}"))?;
    Ok(Some(pid))
}

/// Writes our PID, mode 0600.
fn write_pidfile(path: &str) -> anyhow::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file =
        options.open(path).with_context(|| format!("couldn't write pidfile at '{path}'"))?;
    write!(file, "{}", std::process::id())?;
    Ok(())
}

/// Removes the pidfile, but only if it still holds our PID.
fn remove_pidfile(path: &str) {
    if let Ok(Some(pid)) = read_pidfile(path) {
        if pid == std::process::id() {
            let _ = fs::remove_file(path);
        }
    }
}
