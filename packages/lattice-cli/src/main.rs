//! Lattice CLI - connects a host to Lattice Cloud
//!
//! This binary provides the host-side agent commands:
//! - Authenticate using the OAuth device flow
//! - Report session status
//! - Run the liveness heartbeat daemon (for systemd integration)

mod daemon;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lattice_core::auth::SessionManager;
use lattice_core::cloud::{config, load_cloud_config};

#[derive(Parser)]
#[command(name = "lattice")]
#[command(author = "Lattice Team")]
#[command(version)]
#[command(about = "Lattice agent - secure session management for Lattice Cloud")]
#[command(long_about = "
The Lattice CLI authenticates this host against Lattice Cloud and keeps
the session alive. Commands that manage cloud resources use the session
established here.

Quick start:
  1. Sign in:          lattice login
  2. Check session:    lattice status
  3. Start heartbeat:  lattice run

For systemd integration, see: lattice run --help
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Authenticate with Lattice Cloud using the device flow
    #[command(alias = "connect")]
    Login {
        /// Use a pre-issued refresh token instead of the device flow
        #[arg(long)]
        token: Option<String>,

        /// Display name for this host's identity
        #[arg(long)]
        name: Option<String>,
    },

    /// Show session status
    Status,

    /// Sign out from Lattice Cloud
    #[command(alias = "disconnect")]
    Logout {
        /// Revoke every device and delete the local identity
        #[arg(long)]
        all: bool,
    },

    /// Run the liveness heartbeat daemon
    Run {
        /// Heartbeat interval in seconds
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("lattice={},lattice_core={}", log_level, log_level).into()
            }),
        )
        .with_target(false)
        .init();

    let session = SessionManager::new(load_cloud_config())
        .context("Failed to open local configuration stores")?;

    match &cli.command {
        Commands::Login { token, name } => {
            cmd_login(&cli, &session, token.clone(), name.clone()).await
        }
        Commands::Status => cmd_status(&cli, &session).await,
        Commands::Logout { all } => cmd_logout(&cli, &session, *all).await,
        Commands::Run { interval } => daemon::run_daemon(&session, *interval).await,
        Commands::Config => cmd_config(&cli, &session).await,
    }
}

async fn cmd_login(
    cli: &Cli,
    session: &SessionManager,
    token: Option<String>,
    name: Option<String>,
) -> Result<()> {
    // Check if already signed in
    let status = session.status_check().await;
    if status.authenticated {
        let identity_name = status
            .identity
            .as_ref()
            .map(|i| i.display_name.clone())
            .unwrap_or_default();
        match cli.format {
            OutputFormat::Text => {
                println!("Already signed in as '{}'", identity_name);
                println!("Use 'lattice logout' to sign out first.");
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": "already_authenticated",
                        "identity": identity_name,
                        "user_email": status.user_email,
                    })
                );
            }
        }
        return Ok(());
    }

    // Provisioning path: a pre-issued refresh token skips the device flow.
    if let Some(token) = token {
        let status = session
            .login_with_token(&token, name.as_deref())
            .await
            .context("Token login failed")?;
        print_login_result(cli, &status);
        return Ok(());
    }

    match cli.format {
        OutputFormat::Text => println!("Starting authentication..."),
        OutputFormat::Json => {}
    }

    let (flow, pending) = session
        .begin_login()
        .await
        .context("Could not start device authorization")?;

    match cli.format {
        OutputFormat::Text => {
            println!();
            println!("Please visit the following URL to authorize:");
            println!();
            println!("  {}", pending.verification_url());
            println!();
            println!("Your code: {}", pending.user_code);
            println!();
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "status": "awaiting_authorization",
                    "verification_url": pending.verification_url(),
                    "user_code": pending.user_code,
                    "expires_in": pending.expires_in,
                })
            );
        }
    }

    flow.open_browser(&pending);

    let status = session
        .finish_login(flow, &pending, name.as_deref())
        .await
        .context("Authorization did not complete")?;

    print_login_result(cli, &status);
    Ok(())
}

fn print_login_result(cli: &Cli, status: &lattice_core::AuthStatus) {
    let identity_name = status
        .identity
        .as_ref()
        .map(|i| i.display_name.clone())
        .unwrap_or_default();
    match cli.format {
        OutputFormat::Text => {
            println!();
            println!(
                "Signed in as {} (host identity '{}')",
                status.user_email.as_deref().unwrap_or("-"),
                identity_name
            );
            println!();
            println!("You can now start the heartbeat daemon with: lattice run");
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "status": "authenticated",
                    "identity": identity_name,
                    "user_email": status.user_email,
                    "user_id": status.user_id,
                })
            );
        }
    }
}

async fn cmd_status(cli: &Cli, session: &SessionManager) -> Result<()> {
    let status = session.status_check().await;

    match cli.format {
        OutputFormat::Text => {
            if status.authenticated {
                println!("Status: Signed in");
                println!(
                    "Email:  {}",
                    status.user_email.as_deref().unwrap_or("-")
                );
                if let Some(identity) = &status.identity {
                    println!("Host:   {} ({})", identity.display_name, identity.id);
                }
            } else {
                println!("Status: Not signed in");
                println!();
                println!("Run 'lattice login' to authenticate.");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "authenticated": status.authenticated,
                    "identity": status.identity,
                    "user_email": status.user_email,
                    "user_id": status.user_id,
                })
            );
        }
    }

    Ok(())
}

async fn cmd_logout(cli: &Cli, session: &SessionManager, all: bool) -> Result<()> {
    let status = session.status_check().await;

    if !status.authenticated && status.identity.is_none() {
        match cli.format {
            OutputFormat::Text => println!("Not signed in."),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "status": "not_authenticated" }));
            }
        }
        return Ok(());
    }

    session.logout(all).await.context("Logout failed")?;

    match cli.format {
        OutputFormat::Text => {
            if all {
                println!("Signed out everywhere and reset this host's identity.");
            } else {
                println!("Signed out.");
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "status": "signed_out",
                    "all_devices": all,
                })
            );
        }
    }

    Ok(())
}

async fn cmd_config(cli: &Cli, session: &SessionManager) -> Result<()> {
    let cloud_config = session.config();
    let config_path = config::get_config_file_path_string();

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:   {}", config_path);
            println!(
                "API endpoint:  {} (from {})",
                cloud_config.api_url, cloud_config.source
            );
            println!("Dashboard URL: {}", cloud_config.dashboard_url);
            println!();
            println!("Environment variables:");
            println!("  LATTICE_CLOUD_URL      - Override API endpoint");
            println!("  LATTICE_AGENT_NAME     - Name this host's identity");
            println!("  LATTICE_NONINTERACTIVE - Suppress prompts (CI)");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "api_url": cloud_config.api_url,
                    "api_source": format!("{}", cloud_config.source),
                    "dashboard_url": cloud_config.dashboard_url,
                })
            );
        }
    }

    Ok(())
}
