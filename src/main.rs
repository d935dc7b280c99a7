//! pfcam-realtime CLI - follows the PFCAM notification channel from a
//! terminal.
//!
//! This is the main binary entry point. See the `pfcam_realtime` library
//! for the core functionality.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use pfcam_realtime::{
    ActivitySignal, Claims, Config, CredentialStore, Environment, FileStorage, Identity,
    RealtimeClient, StaticCredentials, StoreChange, SystemClock,
};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "pfcam-realtime")]
#[command(version)]
#[command(about = "Real-time notifications and session watchdog for PFCAM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print notifications until interrupted.
    ///
    /// Each line typed on stdin counts as activity. `list`, `read` and
    /// `clear` act on the notification list.
    Watch {
        /// Numeric user id for the endpoint path.
        #[arg(long)]
        user_id: Option<i64>,
        /// User subject (defaults to the token's `sub` claim).
        #[arg(long)]
        subject: Option<String>,
        /// Backend base URL (overrides config and PFCAM_SERVER_URL).
        #[arg(long)]
        server_url: Option<String>,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let environment = Environment::current();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(environment.default_log_filter()),
    )
    .format_timestamp_secs()
    .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            user_id,
            subject,
            server_url,
        } => {
            let mut config = Config::load()?;
            if let Some(url) = server_url {
                config.connection.server_url = url;
            }
            run_watch(config, user_id, subject).await?;
        }
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Resolve the endpoint identity from flags and the token's claims.
fn resolve_identity(
    user_id: Option<i64>,
    subject: Option<String>,
    token: Option<&str>,
) -> Result<Identity> {
    let subject = subject.or_else(|| {
        token
            .and_then(|t| Claims::decode_unverified(t).ok())
            .and_then(|claims| claims.sub)
    });

    match (user_id, subject) {
        (Some(id), subject) => Ok(Identity::new(subject.unwrap_or_default(), Some(id))),
        (None, Some(subject)) => Ok(Identity::new(subject, None)),
        (None, None) => anyhow::bail!("Pass --user-id or --subject (or a JWT with a `sub` claim)"),
    }
}

async fn run_watch(config: Config, user_id: Option<i64>, subject: Option<String>) -> Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;

    let credentials = Arc::new(StaticCredentials::new(config.token.clone()));
    let identity = resolve_identity(user_id, subject, credentials.token().as_deref())?;
    let storage = Arc::new(FileStorage::in_config_dir().context("Failed to open session storage")?);
    log::info!("Session state at {}", storage.path().display());

    let client = Arc::new(RealtimeClient::new(
        &config,
        Arc::clone(&credentials) as Arc<dyn CredentialStore>,
        storage,
        Arc::new(SystemClock),
    ));

    client.on_connection_change(|connected| {
        println!("[{}]", if *connected { "connected" } else { "disconnected" });
    });
    client.on_store_change(|change| {
        if let StoreChange::Added(n) = change {
            println!(
                "{} [{}] {} - {} ({})",
                n.event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
                n.event.priority,
                n.event.title,
                n.event.body,
                n.event.kind
            );
        }
    });
    client.on_session_expired(|expired| {
        println!("{}", expired.message);
        SHUTDOWN_FLAG.store(true, Ordering::Relaxed);
    });

    let started = if client.session().is_active() {
        client.start(&identity)
    } else {
        client.login(&identity)
    };
    if !started {
        client.stop();
        anyhow::bail!("No usable token. Set PFCAM_TOKEN and try again.");
    }

    spawn_stdin_reader(Arc::clone(&client));

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("Shutting down...");
    client.stop();
    Ok(())
}

/// Treat stdin lines as user activity and simple list commands.
fn spawn_stdin_reader(client: Arc<RealtimeClient>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            client.record_activity(ActivitySignal::KeyPress);
            match line.trim() {
                "list" => {
                    for n in client.list_notifications() {
                        let marker = if n.is_read { ' ' } else { '*' };
                        println!("{} {} {}", marker, n.id, n.event.title);
                    }
                    println!("{} unread", client.unread_count());
                }
                "read" => {
                    println!("Marked {} read", client.mark_all_read());
                }
                "clear" => client.clear_notifications(),
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_identity_prefers_flags() {
        let identity = resolve_identity(Some(7), Some("a@b".to_string()), None).unwrap();
        assert_eq!(identity.endpoint_id(), "7");
        assert_eq!(identity.subject, "a@b");
    }

    #[test]
    fn test_resolve_identity_requires_something() {
        assert!(resolve_identity(None, None, Some("opaque")).is_err());
    }
}
