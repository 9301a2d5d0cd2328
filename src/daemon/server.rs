//! Daemon server - IPC listener and main event loop
//!
//! Every client connection is served on its own task so a long-lived
//! observer never holds up request/response clients.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use interprocess::local_socket::traits::tokio::Listener as ListenerTrait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Notify;

use crate::common::config::{Config, RegistryConfig};
use crate::common::{error::IpcError, paths, Result};
use crate::ipc::{
    protocol::{Command, Request, Response},
    transport,
};

use super::handler;
use super::registry::SessionRegistry;
use super::script::ScriptStore;

/// Request/response clients that go quiet this long are dropped
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Last time a client did anything
#[derive(Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }
}

/// Main daemon server
pub struct Daemon {
    registry: Arc<SessionRegistry>,
    activity: Activity,
    shutdown: Arc<Notify>,
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new(config: Config) -> Self {
        let scripts = ScriptStore::new(paths::script_dir());
        Self {
            registry: Arc::new(SessionRegistry::new(config, scripts)),
            activity: Activity::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Run the daemon main loop
    pub async fn run(&self) -> Result<()> {
        // Create the IPC listener
        let listener = transport::create_listener().await?;
        tracing::info!("Daemon listening on {}", paths::socket_name());

        self.registry.scripts().sweep();
        spawn_signal_watcher(Arc::clone(&self.shutdown));

        let registration = self.registry.config().registry.clone();
        tokio::spawn(async move { register_service(&registration).await });

        let idle_timeout = Duration::from_secs(self.registry.config().daemon.idle_timeout_minutes * 60);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("Shutdown requested, exiting");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            self.activity.touch();
                            let registry = Arc::clone(&self.registry);
                            let shutdown = Arc::clone(&self.shutdown);
                            let activity = self.activity.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(registry, shutdown, activity, stream).await {
                                    tracing::error!("Error handling client: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    // Periodic wakeup to check idle timeout
                    let status = self.registry.status();
                    if !self.registry.has_live_session()
                        && status.observers == 0
                        && self.activity.idle_for() > idle_timeout
                    {
                        tracing::info!("Idle timeout reached, shutting down daemon");
                        break;
                    }
                }
            }
        }

        // Cleanup
        tracing::info!("Cleaning up daemon resources");
        self.registry.shutdown().await;

        // Remove socket file
        paths::remove_socket()?;
        tracing::info!("Daemon shutdown complete");

        Ok(())
    }
}

#[cfg(unix)]
fn spawn_signal_watcher(shutdown: Arc<Notify>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Failed to install signal handlers");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
        }
        shutdown.notify_one();
    });
}

#[cfg(not(unix))]
fn spawn_signal_watcher(shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down gracefully");
            shutdown.notify_one();
        }
    });
}

/// Handle a single client connection
async fn handle_client(
    registry: Arc<SessionRegistry>,
    shutdown: Arc<Notify>,
    activity: Activity,
    stream: transport::platform::Stream,
) -> Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    // Read and process commands until client disconnects
    loop {
        let request_data = tokio::select! {
            result = transport::recv_message(&mut reader) => {
                match result {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        tracing::debug!("Client disconnected");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading request: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(CLIENT_IDLE_TIMEOUT) => {
                tracing::debug!("Client timeout");
                break;
            }
        };

        let request: Request = match serde_json::from_slice(&request_data) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!("Invalid request: {}", e);
                let response = Response::error(
                    0,
                    IpcError {
                        code: "INVALID_REQUEST".to_string(),
                        message: e.to_string(),
                    },
                );
                transport::send_json(&mut writer, &response).await?;
                continue;
            }
        };

        tracing::debug!("Received command: {:?}", request.command);
        activity.touch();

        match request.command {
            Command::Shutdown => {
                transport::send_json(&mut writer, &Response::ok(request.id)).await?;
                shutdown.notify_one();
                break;
            }
            Command::Subscribe => {
                transport::send_json(&mut writer, &Response::ok(request.id)).await?;
                return serve_observer(&registry, reader, writer).await;
            }
            command => {
                let response = handler::handle_command(&registry, request.id, command).await;
                transport::send_json(&mut writer, &response).await?;
            }
        }

        activity.touch();
    }

    Ok(())
}

/// Push a snapshot, then every published message, until the observer
/// goes away or is dropped for falling behind
async fn serve_observer<R, W>(registry: &SessionRegistry, mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWrite + Unpin,
{
    // Subscribe first so nothing published while the snapshot is built is lost.
    let mut subscription = registry.subscribe();
    tracing::debug!(subscriber = subscription.id, "Observer connected");

    let snapshot = registry.snapshot().await;
    if let Err(e) = transport::send_json(&mut writer, &snapshot).await {
        registry.unsubscribe(&subscription);
        return Err(e.into());
    }

    let mut scratch = [0u8; 256];
    loop {
        tokio::select! {
            message = subscription.rx.recv() => {
                let Some(message) = message else {
                    tracing::debug!(subscriber = subscription.id, "Observer dropped by broadcaster");
                    break;
                };
                if let Err(e) = transport::send_json(&mut writer, &message).await {
                    tracing::debug!(subscriber = subscription.id, error = %e, "Observer write failed");
                    break;
                }
            }
            // Observers never send anything; a read only ends on disconnect.
            read = reader.read(&mut scratch) => {
                if matches!(read, Ok(0) | Err(_)) {
                    tracing::debug!(subscriber = subscription.id, "Observer disconnected");
                    break;
                }
            }
        }
    }

    registry.unsubscribe(&subscription);
    Ok(())
}

/// Announce the bridge to the external service directory, if configured
async fn register_service(config: &RegistryConfig) {
    let Some(url) = &config.url else {
        return;
    };

    let body = json!({
        "name": config.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
        "endpoint": paths::socket_name(),
        "capabilities": ["launch", "breakpoints", "step", "evaluate", "console", "subscribe"],
    });

    let result = reqwest::Client::new()
        .post(url)
        .timeout(REGISTRATION_TIMEOUT)
        .json(&body)
        .send()
        .await
        .and_then(|r| r.error_for_status());

    match result {
        Ok(_) => tracing::info!(%url, service = %config.service_name, "Registered with service directory"),
        Err(e) => tracing::warn!(%url, error = %e, "Service registration failed"),
    }
}
