//! measure-session
//!
//! Command-line front end for the measurement API session:
//! 1. `login <username>` exchanges credentials for a token pair
//! 2. `whoami` derives the current identity from the stored token
//! 3. `logout` ends the session locally and tells the server
//!
//! The password is read from `MEASURE_PASSWORD` or the first line of stdin,
//! never from argv.

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use auth_state::{AuthStateManager, HttpTransport, Identity, LoginForm, Transport};
use session_store::{FileStorage, MemoryStorage, SessionStorage, SessionStore};
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StorageBackend};

const USAGE: &str =
    "usage: measure-session [--config PATH] [--json] <login USERNAME | logout | whoami>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login { username: String },
    Logout,
    Whoami,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    config: Option<String>,
    json_logs: bool,
    command: Command,
}

/// Text for the user plus the process exit status.
#[derive(Debug, PartialEq, Eq)]
struct Report {
    code: u8,
    message: String,
}

impl Report {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
        }
    }

    fn fail(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}\n{USAGE}");
            return Ok(ExitCode::from(2));
        }
    };

    init_tracing(args.json_logs);

    let config_path = Config::resolve_path(args.config.as_deref());
    debug!(path = %config_path.display(), "loading configuration");
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let manager = build_manager(&config)?;
    manager.subscribe(|| info!("session state changed"));

    let password = match &args.command {
        Command::Login { .. } => read_password().await?,
        _ => String::new(),
    };

    let report = run(&manager, args.command, &password).await;

    // Give the detached server logout a chance to go out before exit
    if !manager.finish_pending(config.timeout()).await {
        debug!("server logout still in flight at exit");
    }

    if report.code == 0 {
        println!("{}", report.message);
    } else {
        eprintln!("{}", report.message);
    }
    Ok(ExitCode::from(report.code))
}

/// Initialize tracing on stderr with LOG_LEVEL / RUST_LOG support.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

fn parse_args(argv: &[String]) -> std::result::Result<Args, String> {
    let mut config = None;
    let mut json_logs = false;
    let mut positional = Vec::new();

    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                config = Some(path.clone());
            }
            "--json" => json_logs = true,
            flag if flag.starts_with("--") => return Err(format!("unknown flag: {flag}")),
            _ => positional.push(arg.as_str()),
        }
    }

    let command = match positional.as_slice() {
        ["login", username] => Command::Login {
            username: (*username).to_owned(),
        },
        ["logout"] => Command::Logout,
        ["whoami"] => Command::Whoami,
        [] => return Err("missing command".into()),
        other => return Err(format!("unrecognized command: {}", other.join(" "))),
    };

    Ok(Args {
        config,
        json_logs,
        command,
    })
}

fn build_manager(config: &Config) -> Result<AuthStateManager> {
    let storage: Arc<dyn SessionStorage> = match config.session.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::File => Arc::new(FileStorage::new(&config.session.path)),
    };

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        client,
        config.api.base_url.clone(),
        config.timeout(),
    ));

    info!(
        base_url = %config.api.base_url,
        backend = ?config.session.backend,
        "session client configured"
    );

    Ok(AuthStateManager::new(SessionStore::new(storage), transport)
        .with_memo_window(config.memo_window()))
}

async fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var("MEASURE_PASSWORD") {
        return Ok(password);
    }

    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

async fn run(manager: &AuthStateManager, command: Command, password: &str) -> Report {
    match command {
        Command::Login { username } => {
            let form = LoginForm::new(username, password);
            if let Err(errors) = form.validate() {
                return Report::fail(2, errors.join("\n"));
            }

            match manager.login(&form.username, &form.password).await {
                Ok(()) => match manager.get_current_state().await.into_identity() {
                    Identity::Authenticated {
                        display_name, role, ..
                    } => Report::ok(format!("Logged in as {display_name} ({role})")),
                    Identity::Anonymous => Report::ok("Logged in"),
                },
                Err(failure) => Report::fail(1, failure.message()),
            }
        }
        Command::Logout => {
            manager.logout().await;
            Report::ok("Logged out")
        }
        Command::Whoami => match manager.get_current_state().await.into_identity() {
            Identity::Authenticated {
                username,
                display_name,
                role,
            } => Report::ok(format!("{username} ({display_name}) role={role}")),
            Identity::Anonymous => Report::fail(1, "Not logged in"),
        },
    }
}
