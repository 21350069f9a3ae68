//! Gmail MCP Vault
//!
//! Authorizes Google accounts into an encrypted credential store and serves
//! Gmail tools over MCP stdio on behalf of one of them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::MissedTickBehavior;

use gmail_mcp_vault::clock::{to_chrono, SystemClock};
use gmail_mcp_vault::config::{Config, ACCESS_KEY_VAR};
use gmail_mcp_vault::confirmation::ConfirmationGate;
use gmail_mcp_vault::credentials::{AccessKeys, SqliteCredentialStore, TokenCipher};
use gmail_mcp_vault::gmail::GmailClient;
use gmail_mcp_vault::mcp::{McpServer, ToolHandler};
use gmail_mcp_vault::oauth::callback::authorize_interactive;
use gmail_mcp_vault::oauth::{AuthStateStore, GoogleOAuthProvider, OAuthFlow, OAuthKeys};
use gmail_mcp_vault::vault::{CredentialVault, VaultOptions};

/// Gmail MCP Vault
#[derive(Parser)]
#[command(name = "gmail-mcp-vault")]
#[command(author, version, about = "Gmail MCP server with an encrypted per-user credential vault")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize a Google account and print its access key
    Auth,

    /// Run the MCP server on stdio (the default)
    Serve {
        /// Access key printed by `auth`
        #[arg(long, env = "GMAIL_MCP_ACCESS_KEY", hide_env_values = true)]
        access_key: Option<String>,
    },

    /// Delete the stored credential behind an access key
    Revoke {
        /// Access key printed by `auth`
        #[arg(long, env = "GMAIL_MCP_ACCESS_KEY", hide_env_values = true)]
        access_key: Option<String>,
    },

    /// Print a fresh base64 encryption key
    GenerateKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout is the MCP channel.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateKey) => {
            println!("{}", TokenCipher::generate_key());
            eprintln!("Store it as GMAIL_MCP_ENCRYPTION_KEY. Changing it later invalidates every stored credential.");
            Ok(())
        }
        Some(Commands::Auth) => run_auth(Config::new()?).await,
        Some(Commands::Revoke { access_key }) => run_revoke(Config::new()?, access_key),
        Some(Commands::Serve { access_key }) => run_server(Config::new()?, access_key).await,
        None => {
            let access_key = std::env::var(ACCESS_KEY_VAR).ok();
            run_server(Config::new()?, access_key).await
        }
    }
}

/// Wire the Vault to the Google provider and the SQLite store
fn build_vault(config: &Config) -> anyhow::Result<(CredentialVault<GoogleOAuthProvider>, AccessKeys)> {
    if config.find_and_copy_oauth_keys()? {
        tracing::info!(path = %config.oauth_path.display(), "Copied OAuth keys into the config directory");
    }

    let keys = OAuthKeys::load(&config.oauth_path).with_context(|| {
        format!(
            "place gcp-oauth.keys.json in the current directory or {}",
            config.config_dir.display()
        )
    })?;
    let provider = Arc::new(GoogleOAuthProvider::new(keys, config.http_timeout)?);

    let cipher = TokenCipher::from_base64_key(config.require_encryption_key()?)
        .context("GMAIL_MCP_ENCRYPTION_KEY is invalid; create one with `gmail-mcp-vault generate-key`")?;

    let store = SqliteCredentialStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;

    let vault = CredentialVault::new(
        Arc::new(store),
        cipher.clone(),
        provider,
        Arc::new(SystemClock),
        VaultOptions::from_config(config),
    );

    Ok((vault, AccessKeys::new(cipher)))
}

async fn run_auth(config: Config) -> anyhow::Result<()> {
    let (vault, access_keys) = build_vault(&config)?;

    let states = AuthStateStore::new(to_chrono(config.auth_state_ttl), Arc::new(SystemClock));
    let sweeper = spawn_sweeper(config.sweep_interval, "oauth states", {
        let states = states.clone();
        move || states.sweep()
    });
    let flow = OAuthFlow::new(vault, states, config.http_timeout);

    let outcome = authorize_interactive(&flow, &config).await;
    sweeper.abort();
    let user_id = outcome?;
    let access_key = access_keys.issue(&user_id)?;

    eprintln!("Authentication completed successfully!");
    eprintln!("Your access key is printed below. Pass it with --access-key or set {}.", ACCESS_KEY_VAR);
    println!("{}", access_key);

    Ok(())
}

fn run_revoke(config: Config, access_key: Option<String>) -> anyhow::Result<()> {
    let (vault, access_keys) = build_vault(&config)?;
    let user_id = access_keys.resolve(&require_access_key(access_key)?)?;

    if vault.revoke(&user_id)? {
        eprintln!("Stored credential deleted. Also remove the app at https://myaccount.google.com/permissions to revoke the grant itself.");
    } else {
        eprintln!("No stored credential for this access key.");
    }

    Ok(())
}

async fn run_server(config: Config, access_key: Option<String>) -> anyhow::Result<()> {
    let (vault, access_keys) = build_vault(&config)?;
    let user_id = access_keys.resolve(&require_access_key(access_key)?)?;

    let gate = ConfirmationGate::new(to_chrono(config.confirmation_ttl), Arc::new(SystemClock));
    let sweeper = spawn_sweeper(config.sweep_interval, "confirmation tokens", {
        let gate = gate.clone();
        move || gate.sweep()
    });

    let gmail_client = GmailClient::new(config.http_timeout)?;

    tracing::info!(user_id = %user_id, "Starting MCP server on stdio");
    let mut server = McpServer::new(ToolHandler::new(vault, gate, gmail_client, user_id));
    let outcome = server.run_stdio().await;

    sweeper.abort();
    Ok(outcome?)
}

fn require_access_key(access_key: Option<String>) -> anyhow::Result<String> {
    access_key.filter(|k| !k.trim().is_empty()).with_context(|| {
        format!(
            "no access key: pass --access-key or set {} (run `gmail-mcp-vault auth` to get one)",
            ACCESS_KEY_VAR
        )
    })
}

/// Periodically purge expired ephemeral entries
fn spawn_sweeper<F>(period: Duration, what: &'static str, sweep: F) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> usize + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let removed = sweep();
            if removed > 0 {
                tracing::debug!(what, removed, "Swept expired entries");
            }
        }
    })
}
