mod client;
mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use libpartyline::{PartyConfig, SessionMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "partyline", about = "Multi-user prompt party for a shared coding agent")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a new party
    Host {
        /// Your display name
        #[arg(long)]
        user: Option<String>,

        /// Address to bind
        #[arg(long)]
        bind_host: Option<String>,

        /// Port to bind
        #[arg(long)]
        port: Option<u16>,

        /// Public host/IP written into the invite code
        #[arg(long)]
        public_host: Option<String>,

        /// Public port written into the invite code
        #[arg(long)]
        public_port: Option<u16>,

        /// Shell command to host
        #[arg(long)]
        command: Option<String>,

        /// Session mode: interactive or batch
        #[arg(long)]
        mode: Option<String>,

        /// Seconds of quiet before queued prompts are merged
        #[arg(long)]
        dedupe_window: Option<f64>,

        /// Minimum queued prompts before a merge runs
        #[arg(long)]
        min_prompts: Option<usize>,

        /// Suffix of an output line that marks a long-lived batch agent as
        /// idle again. Only newline-terminated output is inspected, so a
        /// prompt printed without a trailing newline never matches.
        #[arg(long)]
        ready_marker: Option<String>,

        /// Working directory for the hosted process
        #[arg(long)]
        project_dir: Option<PathBuf>,

        /// Serve without joining the party from this terminal
        #[arg(long)]
        headless: bool,

        /// Send stdin lines as raw terminal input instead of prompts
        #[arg(long)]
        raw: bool,
    },

    /// Join an existing party
    Join {
        /// Invite code (partyline://host:port/secret)
        invite: String,

        /// Your display name
        #[arg(long)]
        user: Option<String>,

        /// Send stdin lines as raw terminal input instead of prompts
        #[arg(long)]
        raw: bool,
    },
}

fn parse_mode(mode: &str) -> anyhow::Result<SessionMode> {
    match mode {
        "interactive" => Ok(SessionMode::Interactive),
        "batch" => Ok(SessionMode::Batch),
        other => anyhow::bail!("unknown mode '{other}' (expected interactive or batch)"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "libpartyline=debug,partyline=debug"
    } else {
        "libpartyline=info,partyline=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Commands::Host {
            user,
            bind_host,
            port,
            public_host,
            public_port,
            command,
            mode,
            dedupe_window,
            min_prompts,
            ready_marker,
            project_dir,
            headless,
            raw,
        } => {
            let mut config = PartyConfig::load().context("failed to load config file")?;
            if let Some(user) = user {
                config.user = user;
            }
            if let Some(bind_host) = bind_host {
                config.bind_host = bind_host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if public_host.is_some() {
                config.public_host = public_host;
            }
            if public_port.is_some() {
                config.public_port = public_port;
            }
            if command.is_some() {
                config.agent_command = command;
            }
            if let Some(mode) = mode {
                config.mode = parse_mode(&mode)?;
            }
            if let Some(window) = dedupe_window {
                config.dedupe_window_secs = window;
            }
            if let Some(min_prompts) = min_prompts {
                config.min_prompts = min_prompts;
            }
            if let Some(ready_marker) = ready_marker {
                config.ready_marker = ready_marker;
            }
            if project_dir.is_some() {
                config.project_dir = project_dir;
            }
            commands::host(config, headless, raw).await
        }
        Commands::Join { invite, user, raw } => commands::join(invite, user, raw).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn mode_strings() {
        assert_eq!(parse_mode("interactive").unwrap(), SessionMode::Interactive);
        assert_eq!(parse_mode("batch").unwrap(), SessionMode::Batch);
        assert!(parse_mode("pty").is_err());
    }
}
