use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod config;
mod error;
mod exec;
mod request;
mod shell;

use config::ExecConfig;
use error::ExecError;
use exec::{CodeExecutor, ConfiguredFactory, ExecSettings, Hooks, PauseGate, SessionRegistry};
use request::ExecRequest;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries responses only
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ExecConfig::load().context("Failed to load configuration")?;
    info!(backend = ?config.backend, "starting agent-shell");

    let gate = PauseGate::new();
    let hooks = Hooks {
        intervention: Arc::new(gate.clone()),
        ..Hooks::default()
    };

    let settings = ExecSettings::from_config(&config);
    let factory = Arc::new(ConfiguredFactory::new(config));
    let registry = SessionRegistry::open(factory)
        .await
        .context("Failed to open the default session")?;
    let mut executor = CodeExecutor::new(registry, settings, hooks);

    // Spawn stdin reader
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });

    // Ctrl-C cancels whatever is running
    let canceller = gate.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            canceller.cancel();
        }
    });

    // SIGUSR1 pauses at the next checkpoint, SIGUSR2 resumes
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let toggler = gate.clone();
        match (
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
        ) {
            (Ok(mut pause), Ok(mut resume)) => {
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            Some(()) = pause.recv() => {
                                info!("pause requested");
                                toggler.pause();
                            }
                            Some(()) = resume.recv() => {
                                info!("resume requested");
                                toggler.resume();
                            }
                            else => break,
                        }
                    }
                });
            }
            _ => warn!("pause/resume signals unavailable"),
        }
    }

    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        if line.trim().is_empty() {
            continue;
        }

        let (reply, cancelled) = match serde_json::from_str::<ExecRequest>(&line) {
            Ok(request) => match executor.execute(&request).await {
                Ok(response) => (json!({ "response": response }), false),
                Err(e) => {
                    error!(error = %e, session = request.session, "request failed");
                    let cancelled = matches!(e, ExecError::Cancelled);
                    (json!({ "error": e.to_string() }), cancelled)
                }
            },
            Err(e) => (json!({ "error": format!("Invalid request: {}", e) }), false),
        };

        stdout.write_all(format!("{}\n", reply).as_bytes()).await?;
        stdout.flush().await?;

        if cancelled {
            break;
        }
    }

    executor.shutdown().await;
    info!("agent-shell stopped");
    Ok(())
}
