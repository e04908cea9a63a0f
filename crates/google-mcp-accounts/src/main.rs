use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use google_mcp_auth::scopes::{known_services, required_scopes};
use google_mcp_auth::{fan_out, AccountManager, AccountState, AuthError, OAuthConfig, DEFAULT_TASK_TIMEOUT};

const SCOPE_BASE: &str = "https://www.googleapis.com/auth/";

#[derive(Parser, Debug)]
#[command(name = "google-mcp-accounts", version, about = "Manage Google accounts for the Google MCP server")]
struct Args {
    /// Log filter (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List authenticated accounts
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Sign in with a new account in the browser
    Add,
    /// Revoke and forget an account
    Remove { email: String },
    /// Refresh an account's token, re-consenting in the browser if needed
    Refresh { email: String },
    /// Check granted scopes for a service on one account or all of them
    Check {
        service: String,
        /// Account email or hint; all accounts when omitted
        #[arg(long)]
        account: Option<String>,
    },
    /// Request additional scopes (service names or scope URLs) for an account
    Upgrade {
        email: String,
        #[arg(required = true)]
        scopes: Vec<String>,
    },
}

fn init_tracing(log_level: Option<&str>) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // stdout is reserved for command output
    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Service names expand to their required scopes; bare names get the Google prefix.
fn expand_scopes(args: &[String]) -> Vec<String> {
    let mut scopes = Vec::new();
    for arg in args {
        if known_services().any(|s| s == arg.as_str()) {
            scopes.extend(required_scopes(arg));
        } else if arg.starts_with("https://") {
            scopes.push(arg.clone());
        } else {
            scopes.push(format!("{}{}", SCOPE_BASE, arg));
        }
    }
    scopes
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match run(args.command, &cancel).await {
        Ok(()) => {}
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(command: Command, cancel: &CancellationToken) -> anyhow::Result<()> {
    let config = Arc::new(OAuthConfig::load()?);
    let manager = AccountManager::new(config).await?;

    let result = dispatch(&manager, command, cancel).await;
    manager.shutdown().await;
    result
}

async fn dispatch(
    manager: &AccountManager,
    command: Command,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::List { json } => {
            let details = manager.account_details(None).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&details)?);
            } else if details.is_empty() {
                println!("No accounts. Run: google-mcp-accounts add");
            } else {
                for info in details {
                    let expiry = info
                        .expiry
                        .map(|e| e.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}\t{}\t{}\texpires {}",
                        info.email,
                        info.name.as_deref().unwrap_or("-"),
                        info.state,
                        expiry
                    );
                }
            }
        }
        Command::Add => {
            let account = manager.add_account(cancel).await?;
            println!("Added {}", account.email());
        }
        Command::Remove { email } => {
            manager.remove_account(&email).await?;
            println!("Removed {}", email);
        }
        Command::Refresh { email } => {
            let account = manager.get_account(&email).await?;
            match account.client().state().await {
                AccountState::Authenticated => manager.refresh_account(&email).await?,
                AccountState::NeedsInteractiveAuth => manager.reauthorize(&email, cancel).await?,
            }
            println!("Refreshed {}", account.email());
        }
        Command::Check { service, account: Some(hint) } => {
            let account = manager.resolve_for_context(&hint).await?;
            check_one(manager, account.email(), &service).await?;
        }
        Command::Check { service, account: None } => {
            let checker = manager.scope_checker().clone();
            let task_service = service.clone();
            let out = fan_out(manager, DEFAULT_TASK_TIMEOUT, move |account| {
                let checker = checker.clone();
                let service = task_service.clone();
                async move {
                    let credential = account.client().credential().await.ok_or_else(|| {
                        AuthError::ReauthRequired {
                            account: account.email().to_string(),
                            reason: "no usable credential".into(),
                        }
                    })?;
                    checker
                        .check(account.email(), &credential.access_token, &service)
                        .await
                }
            })
            .await?;

            for email in out.results.keys() {
                println!("{}\tok", email);
            }
            for (email, e) in &out.errors {
                println!("{}\tfailed", email);
                eprintln!("{}", e.remediation(&service, email).unwrap_or_else(|| e.to_string()));
            }
            if out.is_partial() {
                anyhow::bail!("{} account(s) failed the {} check", out.errors.len(), service);
            }
        }
        Command::Upgrade { email, scopes } => {
            let scopes = expand_scopes(&scopes);
            match manager.upgrade_scopes(&email, &scopes).await {
                Err(AuthError::ReauthRequired { .. }) => {
                    info!("Opening browser to grant: {}", scopes.join(" "));
                    manager.reauthorize(&email, cancel).await?;
                    println!("Upgraded {}", email);
                }
                Err(e) => return Err(e.into()),
                Ok(()) => println!("Upgraded {}", email),
            }
        }
    }
    Ok(())
}

async fn check_one(manager: &AccountManager, email: &str, service: &str) -> anyhow::Result<()> {
    match manager.require_scopes(email, service).await {
        Ok(()) => {
            println!("{}\tok", email);
            Ok(())
        }
        Err(e) => {
            println!("{}\tfailed", email);
            match e.remediation(service, email) {
                Some(help) => anyhow::bail!("{}", help),
                None => Err(e.into()),
            }
        }
    }
}
