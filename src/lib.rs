pub mod clients;
pub mod cloud;
pub mod coalescer;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ipc;
pub mod metrics;
pub mod mode;
pub mod notifier;
pub mod pipeline;
pub mod retry;
pub mod state;
pub mod tasks;
pub mod transport;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cloud::CloudQueryService;
use crate::collaborators::{
    load_properties_file, CertSelector, CompositeEventBus, FileCertSelector, HttpSigningHelper,
    MapStore, ScriptFlashHelper, SharedEventBus, TracingEventBus,
};
use crate::config::{BuildType, ConfigFacade, DeviceInfo, ImageDetails};
use crate::dispatcher::Dispatcher;
use crate::ipc::ipc_router;
use crate::metrics::router::metrics_router;
use crate::mode::{AppMode, ModeController};
use crate::notifier::{Notifier, TlsConfig};
use crate::pipeline::UpgradePipeline;
use crate::retry::RetryOrchestrator;
use crate::state::DownloadStateMachine;
use crate::transport::HttpTransport;

/// Initial backoff delay for MQTT reconnection attempts (in milliseconds).
const MQTT_INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay for MQTT reconnection attempts (in milliseconds).
const MQTT_MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(long, env)]
    pub device_model: String,
    #[clap(long, env, default_value = "Unknown")]
    pub device_manufacturer: String,
    #[clap(long, env)]
    pub device_serial_number: String,
    #[clap(long, env)]
    pub device_estb_mac: String,
    #[clap(long, env, default_value = "prod")]
    pub build_type: String,
    #[clap(long, env)]
    pub image_download_path: std::path::PathBuf,
    #[clap(long, env)]
    pub persistent_path: std::path::PathBuf,
    #[clap(long, env, default_value = "RCDL")]
    pub capabilities: String,
    #[clap(long, env, default_value = "")]
    pub partner_id: String,
    #[clap(long, env, default_value = "")]
    pub experience: String,
    #[clap(long, env)]
    pub running_image_name: String,

    /// `/etc/device.properties`-style file (accountID, timezone, ...).
    #[clap(long, env)]
    pub device_properties_path: std::path::PathBuf,
    /// RFC/remote-config override file, same `key=value` format.
    #[clap(long, env)]
    pub rfc_config_path: Option<std::path::PathBuf>,
    /// Maintenance opt-out marker file (`IGNORE_UPDATE` / `ENFORCE_OPTOUT`).
    #[clap(long, env)]
    pub opt_out_path: std::path::PathBuf,

    /// Directory holding the cloud response cache's two files.
    #[clap(long, env)]
    pub cloud_cache_dir: std::path::PathBuf,
    /// Directory holding the sticky-block marker files.
    #[clap(long, env)]
    pub sticky_marker_dir: std::path::PathBuf,

    /// Client certificate for the DIRECT/mTLS transport.
    #[clap(long, env)]
    pub mtls_cert_path: Option<std::path::PathBuf>,
    /// Client key for the DIRECT/mTLS transport.
    #[clap(long, env)]
    pub mtls_key_path: Option<std::path::PathBuf>,
    /// External codebig-style signing endpoint for the SIGNED transport.
    #[clap(long, env)]
    pub signing_helper_url: String,
    /// Script invoked with the downloaded image path to perform the flash.
    #[clap(long, env)]
    pub flash_script_path: std::path::PathBuf,

    #[clap(long, env)]
    pub mqtt_url: Option<String>,
    #[clap(long, env, default_value = "")]
    pub mqtt_username: String,
    #[clap(long, env, default_value = "")]
    pub mqtt_password: String,
    #[clap(long, env, default_value = "rdk-fwupdater")]
    pub mqtt_topic: String,
    /// Path to MQTT CA certificate file (enables TLS if provided)
    #[clap(long, env)]
    pub mqtt_ca_cert_path: Option<String>,
    /// Path to MQTT client certificate file
    #[clap(long, env)]
    pub mqtt_client_cert_path: Option<String>,
    /// Path to MQTT client key file
    #[clap(long, env)]
    pub mqtt_client_key_path: Option<String>,

    #[clap(long, env, default_value = "0.0.0.0:9001")]
    pub listen_addr: String,
    #[clap(long, env, default_value = "0.0.0.0:9090")]
    pub metrics_listen_addr: String,
    #[clap(long, env, default_value = "info")]
    log_level: LevelFilter,
}

/// Runs the firmware-update daemon with the provided CLI configuration.
///
/// Initializes logging, assembles the dispatcher's full dependency graph,
/// and starts the IPC and metrics servers side by side. Optionally starts
/// an MQTT connection both to publish domain events and to relay an
/// inbound foreground/background mode topic to the dispatcher.
///
/// # Errors
///
/// Returns an error if required device-properties fields are missing,
/// MQTT TLS certificates cannot be read, the MQTT client fails to
/// initialize, or either listen address fails to bind.
///
/// # Panics
///
/// Panics if the Ctrl+C signal handler fails to register.
#[allow(clippy::too_many_lines)]
pub async fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::registry()
        .with(cli.log_level)
        .with(fmt::layer())
        .init();

    let cancel_token = CancellationToken::new();

    let ctrl_c_listener_task = tokio::spawn({
        let cancel_token_clone = cancel_token.clone();
        async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C signal");
            info!("Ctrl+C received, proceeding with graceful shutdown...");
            cancel_token_clone.cancel();
        }
    });

    let properties = load_properties_file(&cli.device_properties_path)
        .map(Arc::new)
        .unwrap_or_else(|e| {
            warn!(error = %e, path = %cli.device_properties_path.display(), "no device properties file; continuing with an empty store");
            Arc::new(MapStore::default())
        });
    let rfc = match &cli.rfc_config_path {
        Some(path) => load_properties_file(path)
            .map(Arc::new)
            .unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "failed reading remote-config override file");
                Arc::new(MapStore::default())
            }),
        None => Arc::new(MapStore::default()),
    };

    let device = DeviceInfo {
        model: cli.device_model.clone(),
        manufacturer: cli.device_manufacturer.clone(),
        serial_number: cli.device_serial_number.clone(),
        estb_mac: cli.device_estb_mac.clone(),
        build_type: BuildType::parse(&cli.build_type),
        image_download_path: cli.image_download_path.clone(),
        persistent_path: cli.persistent_path.clone(),
        capabilities: cli.capabilities.clone(),
        partner_id: cli.partner_id.clone(),
        experience: cli.experience.clone(),
        maintenance_mode: false,
        software_optout: false,
    };
    let image = ImageDetails {
        running_image_name: cli.running_image_name.clone(),
    };
    let state_red = Arc::new(AtomicBool::new(false));
    let config = Arc::new(ConfigFacade::new(device, image, properties, rfc, state_red.clone()));

    let mtls = match (&cli.mtls_cert_path, &cli.mtls_key_path) {
        (Some(cert_path), Some(key_path)) => FileCertSelector {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        }
        .select(),
        _ => None,
    };
    let transport = Arc::new(HttpTransport::new(mtls));
    let signing_helper = Arc::new(HttpSigningHelper::new(cli.signing_helper_url.clone()));
    let flash_helper = Arc::new(ScriptFlashHelper {
        script_path: cli.flash_script_path.clone(),
    });

    let download_state = Arc::new(DownloadStateMachine::default());
    let orchestrator = Arc::new(RetryOrchestrator::new(
        transport.clone(),
        signing_helper,
        cli.sticky_marker_dir.clone(),
        state_red,
    ));

    let force_exit = Arc::new(AtomicBool::new(false));

    // MQTT notifier setup. The client is built eagerly (it publishes domain
    // events); its eventloop is polled once the dispatcher exists, since the
    // mode topic relays straight into `Dispatcher::on_app_mode_change`.
    let mut notifier: Option<Notifier> = None;
    let mut mqtt_eventloop: Option<rumqttc::EventLoop> = None;
    if let Some(mqtt_url) = cli.mqtt_url.clone() {
        let tls_config = if let Some(ca_path) = &cli.mqtt_ca_cert_path {
            let ca_cert = std::fs::read(ca_path).context("failed to read MQTT CA cert")?;
            let client_auth = match (&cli.mqtt_client_cert_path, &cli.mqtt_client_key_path) {
                (Some(cert_path), Some(key_path)) => {
                    let client_cert = std::fs::read(cert_path).context("failed to read MQTT client cert")?;
                    let client_key = std::fs::read(key_path).context("failed to read MQTT client key")?;
                    Some((client_cert, client_key))
                }
                (None, None) => None,
                _ => {
                    warn!(
                        "Incomplete MQTT client auth configuration: both mqtt_client_cert_path and \
                         mqtt_client_key_path must be provided for client authentication. \
                         Continuing without client auth."
                    );
                    None
                }
            };
            Some(TlsConfig { ca_cert, client_auth })
        } else {
            None
        };

        match Notifier::new(mqtt_url, cli.mqtt_username.clone(), cli.mqtt_password.clone(), cli.mqtt_topic.clone(), tls_config) {
            Ok((n, eventloop)) => {
                notifier = Some(n);
                mqtt_eventloop = Some(eventloop);
            }
            Err(e) => {
                error!("Failed to initialize notifier: {:?}", e);
                return Err(e);
            }
        }
    }

    let mut buses: Vec<SharedEventBus> = vec![Arc::new(TracingEventBus)];
    if let Some(n) = notifier.clone() {
        buses.push(Arc::new(n));
    }
    let events: SharedEventBus = Arc::new(CompositeEventBus(buses));

    let mode_ctl = Arc::new(ModeController::new(events.clone(), force_exit));

    let cloud = CloudQueryService::new(transport, cli.cloud_cache_dir.clone(), config.clone());
    let pipeline = UpgradePipeline::new(config, download_state, events, flash_helper, orchestrator, mode_ctl);
    let dispatcher = Arc::new(Dispatcher::new(cloud, pipeline, cli.opt_out_path.clone()));

    let mqtt_eventloop_task = mqtt_eventloop.map(|eventloop| {
        let mode_topic = format!("{}/mode", cli.mqtt_topic);
        spawn_mqtt_eventloop(eventloop, mode_topic, dispatcher.clone(), cancel_token.clone())
    });

    let ipc_cancel_token = cancel_token.clone();
    let metrics_cancel_token = cancel_token.clone();

    tokio::try_join!(
        start_ipc_server(&cli.listen_addr, dispatcher, ipc_cancel_token),
        start_metrics_server(&cli.metrics_listen_addr, metrics_cancel_token),
    )?;

    if let Some(task) = mqtt_eventloop_task {
        let _ = task.await;
    }
    ctrl_c_listener_task.await?;

    info!("All services shut down gracefully.");

    Ok(())
}

/// Polls the MQTT eventloop, reconnecting with exponential backoff, and
/// relays any publish on `mode_topic` to [`Dispatcher::on_app_mode_change`].
fn spawn_mqtt_eventloop(
    mut eventloop: rumqttc::EventLoop,
    mode_topic: String,
    dispatcher: Arc<Dispatcher>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use rumqttc::{Event, Packet};
        let mut consecutive_errors: u32 = 0;
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!("MQTT event loop shutting down");
                    break;
                }
                result = eventloop.poll() => {
                    match result {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            if consecutive_errors > 0 {
                                info!(previous_errors = consecutive_errors, "MQTT connection restored");
                            }
                            consecutive_errors = 0;
                        }
                        Ok(Event::Incoming(Packet::Publish(p))) if p.topic == mode_topic => {
                            match p.payload.as_ref() {
                                b"BACKGROUND" => dispatcher.on_app_mode_change(AppMode::Background).await,
                                b"FOREGROUND" => dispatcher.on_app_mode_change(AppMode::Foreground).await,
                                other => warn!(payload = ?other, "unrecognized mode-topic payload"),
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            consecutive_errors = consecutive_errors.saturating_add(1);
                            if consecutive_errors == 1 {
                                error!(error = ?e, "MQTT connection error");
                            } else {
                                debug!(error = ?e, consecutive_errors, "MQTT still disconnected");
                            }
                            let backoff_ms = MQTT_INITIAL_BACKOFF_MS
                                .saturating_mul(2_u64.saturating_pow(consecutive_errors.saturating_sub(1)))
                                .min(MQTT_MAX_BACKOFF_MS);
                            tokio::select! {
                                () = cancel_token.cancelled() => {
                                    info!("MQTT event loop shutting down during backoff");
                                    break;
                                }
                                () = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                            }
                        }
                    }
                }
            }
        }
    })
}

async fn start_ipc_server(listen_address: &str, dispatcher: Arc<Dispatcher>, cancel_token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen_address).await.map_err(|e| anyhow!("failed to bind IPC listener on {listen_address}: {e}"))?;
    info!("IPC bus listening on {}", listener.local_addr()?);

    let shutdown_future = async move {
        cancel_token.cancelled().await;
    };

    axum::serve(listener, ipc_router(dispatcher))
        .with_graceful_shutdown(shutdown_future)
        .await?;
    info!("IPC server shut down gracefully");
    Ok(())
}

async fn start_metrics_server(listen_address: &str, cancel_token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen_address).await.map_err(|e| anyhow!("failed to bind metrics listener on {listen_address}: {e}"))?;
    info!("Metrics server listening on {}", listener.local_addr()?);

    let shutdown_future = async move {
        cancel_token.cancelled().await;
    };

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(shutdown_future)
        .await?;
    info!("Metrics server shut down gracefully");
    Ok(())
}
