#![allow(missing_docs)]

//! mu control plane binary.
//!
//! Thin host around the library: loads `config.json`, bootstraps the
//! control plane against the repository root, and keeps it running until
//! interrupted. The real deployment embeds the library behind an HTTP
//! server; this binary is the standalone/terminal entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use mu_control_plane::bootstrap::{bootstrap, HostSeams};
use mu_control_plane::config::Config;
use mu_control_plane::logging;
use mu_control_plane::pipeline::render::{mode_for_channel, render_result};
use mu_control_plane::types::Channel;

#[derive(Parser)]
#[command(name = "mu-control-plane", about = "Control plane for operator-driven messaging")]
struct Cli {
    /// Repository root; defaults to the current directory.
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Config file; defaults to `<repo_root>/config.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until interrupted.
    Start,
    /// Validate the configuration and exit.
    CheckConfig,
    /// Run a single `/mu` command through the terminal pipeline.
    Exec {
        /// The command text, e.g. "/mu status".
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo_root = match cli.repo_root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let config_path = cli
        .config
        .unwrap_or_else(|| repo_root.join("config.json"));

    match cli.command {
        Command::CheckConfig => {
            logging::init_terminal();
            let config = Config::load(&config_path)?;
            println!(
                "config ok: slack={} discord={} telegram={} neovim={} vscode={} editor={}",
                config.adapters.slack.enabled,
                config.adapters.discord.enabled,
                config.adapters.telegram.enabled,
                config.adapters.neovim.enabled,
                config.adapters.vscode.enabled,
                config.adapters.editor.enabled,
            );
            Ok(())
        }
        Command::Exec { text } => {
            logging::init_terminal();
            let config = Config::load(&config_path)?;
            let plane = bootstrap(config, &repo_root, HostSeams::default())
                .await
                .context("bootstrap control plane")?;
            let result = plane
                .pipeline
                .handle_terminal_inbound(&text, &repo_root.display().to_string(), None)
                .await
                .context("execute terminal command")?;
            println!("{}", render_result(&result, mode_for_channel(Channel::Editor)));
            plane.shutdown().await;
            Ok(())
        }
        Command::Start => {
            let _log_guard =
                logging::init_server(&repo_root).context("initialise logging")?;
            let config = Config::load(&config_path)?;
            let plane = bootstrap(config, &repo_root, HostSeams::default())
                .await
                .context("bootstrap control plane")?;
            info!("mu control plane ready");

            tokio::signal::ctrl_c()
                .await
                .context("wait for shutdown signal")?;
            info!("shutdown signal received");
            plane.shutdown().await;
            Ok(())
        }
    }
}
