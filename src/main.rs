use std::sync::Arc;

use clap::Parser;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use voxcore::assets::SoundBank;
use voxcore::audio::opus::OpusCodecs;
use voxcore::cli::{Cli, Command};
use voxcore::collaborators::{AudioCodec, HostBoard, LogDisplay, NullThings, Ota, StaticOta};
use voxcore::config::DeviceConfig;
use voxcore::control_server;
use voxcore::orchestrator::{Collaborators, Orchestrator};
use voxcore::ota::HttpOta;
use voxcore::protocol::{CAPTURE_SAMPLE_RATE, ClientCommand, ServerReply};
use voxcore::tasks::gpio::{self, GpioConfig};
use voxcore::transport::build_transport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("voxcore=debug".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Device {
            bind,
            transport,
            websocket_url,
            ota_url,
            realtime,
            assets,
            gpio_button,
        } => {
            let mut config = DeviceConfig::from_env()?;
            config.control_bind = bind;
            if let Some(transport) = transport {
                config.transport = transport.parse()?;
            }
            if let Some(url) = websocket_url {
                config.websocket.url = url;
            }
            if ota_url.is_some() {
                config.ota_url = ota_url;
            }
            if realtime {
                config.realtime_chat = true;
            }
            if let Some(dir) = assets {
                config.assets_dir = dir.into();
            }
            if gpio_button.is_some() {
                config.gpio_button_pin = gpio_button;
            }
            run_device(config).await
        }
        Command::Client { addr, action } => {
            let reply = control_server::send_command(&addr, action.into()).await?;
            println!("{}", reply);
            if matches!(reply, ServerReply::Error { .. }) {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run_device(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    tracing::info!(
        device_id = %config.device_id,
        version = %config.firmware_version,
        transport = ?config.transport,
        "starting device"
    );

    let runtime = Handle::current();
    let parts = Collaborators {
        codec: audio_codec(&config),
        codecs: Arc::new(OpusCodecs),
        display: Arc::new(LogDisplay),
        board: Arc::new(HostBoard::default()),
        things: Arc::new(NullThings),
        ota: version_service(&config, runtime.clone()),
        wake_word: None,
        processor: None,
        sounds: SoundBank::load(&config.assets_dir),
    };
    let (orchestrator, control) = Orchestrator::new(parts, config.realtime_chat)?;
    let control_thread = control.spawn()?;

    {
        let orchestrator = orchestrator.clone();
        let mut config = config.clone();
        let runtime = runtime.clone();
        std::thread::Builder::new()
            .name("startup".to_string())
            .spawn(move || {
                orchestrator.start(|settings, sink| {
                    config.apply_server_settings(settings);
                    if let Err(err) = config.validate() {
                        tracing::error!("transport settings invalid: {}", err);
                        return None;
                    }
                    Some(build_transport(&config, runtime, sink))
                });
            })?;
    }

    let shutdown_rx = orchestrator.shutdown_signal();
    let (client_tx, client_rx) = mpsc::channel::<ClientCommand>(16);
    match control_server::bind(&config.control_bind).await {
        Ok(listener) => {
            tokio::spawn(control_server::serve(
                listener,
                client_tx.clone(),
                orchestrator.status(),
                shutdown_rx.clone(),
            ));
        }
        Err(err) => tracing::error!("failed to bind {}: {}", config.control_bind, err),
    }
    tokio::spawn(gpio::run(
        GpioConfig {
            button_pin: config.gpio_button_pin,
        },
        client_tx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(control_server::dispatch_commands(
        client_rx,
        orchestrator.clone(),
        shutdown_rx.clone(),
    ));

    let mut shutdown = shutdown_rx;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
        }
        _ = shutdown.wait_for(|stop| *stop) => {
            tracing::info!("shutdown requested by the device");
        }
    }
    orchestrator.shutdown();

    if tokio::task::spawn_blocking(move || control_thread.join())
        .await?
        .is_err()
    {
        tracing::error!("control loop panicked");
    }
    Ok(())
}

fn audio_codec(config: &DeviceConfig) -> Arc<dyn AudioCodec> {
    #[cfg(feature = "host-audio")]
    {
        use voxcore::audio::host::{HostCodec, HostCodecConfig};

        Arc::new(HostCodec::new(HostCodecConfig {
            capture_device: config.capture_device.clone(),
            mock_file: config.mock_audio_file.clone(),
            preferred_input_rate: CAPTURE_SAMPLE_RATE,
        }))
    }

    #[cfg(not(feature = "host-audio"))]
    {
        let _ = config;
        Arc::new(voxcore::collaborators::SilentCodec::new(CAPTURE_SAMPLE_RATE))
    }
}

fn version_service(config: &DeviceConfig, runtime: Handle) -> Arc<dyn Ota> {
    let Some(url) = config.ota_url.clone() else {
        tracing::info!("no OTA_URL configured; skipping version service");
        return Arc::new(StaticOta::new(config.firmware_version.clone()));
    };
    match HttpOta::new(url, config, runtime) {
        Ok(ota) => Arc::new(ota),
        Err(err) => {
            tracing::error!("version service unavailable: {}", err);
            Arc::new(StaticOta::new(config.firmware_version.clone()))
        }
    }
}
