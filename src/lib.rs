pub mod agent;
pub mod channels;
pub mod config;
pub mod error;
pub mod modbus;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod solar;

use crate::prelude::*;

use crate::agent::Agent;
use crate::mqtt::Mqtt;
use tokio_util::sync::CancellationToken;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn app() -> Result<()> {
    let options = Options::new();

    init_logging();

    info!("huawei-solar-bridge {} starting", CARGO_PKG_VERSION);

    let config = Config::new(options.config_file.clone())?;
    apply_loglevel(config.loglevel());

    let shutdown = CancellationToken::new();
    let channels = Channels::new();
    let agent = Agent::new(config.clone(), channels.clone(), shutdown.clone());

    if options.once {
        let telemetry = agent.once().await?;
        println!("{}", serde_json::to_string_pretty(&telemetry)?);
        return Ok(());
    }

    let mqtt = Mqtt::new(config.mqtt.clone(), channels.clone());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c: {}", e);
            }
            info!("Shutdown signal received, stopping components...");
            shutdown.cancel();
        }
    });

    let mqtt_handle = tokio::spawn({
        let mqtt = mqtt.clone();
        async move {
            if let Err(e) = mqtt.start().await {
                error!("MQTT task failed: {}", e);
            }
        }
    });

    let result = agent.start().await;
    if let Err(e) = &result {
        error!("Agent failed: {}", e);
    }

    shutdown.cancel();
    mqtt.stop();
    if let Err(e) = mqtt_handle.await {
        error!("Error waiting for mqtt task: {}", e);
    }

    info!("Shutdown complete");
    result
}

// Everything is let through until the config has been read; RUST_LOG, when
// set, always wins over the configured level.
fn init_logging() {
    let rust_log = std::env::var_os("RUST_LOG").is_some();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();

    if !rust_log {
        log::set_max_level(log::LevelFilter::Info);
    }
}

fn apply_loglevel(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }

    match level.parse::<log::LevelFilter>() {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("unknown loglevel {}, keeping info", level),
    }
}
