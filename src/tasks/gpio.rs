use tokio::sync::{mpsc, watch};

use crate::protocol::ClientCommand;

#[derive(Debug, Clone)]
pub struct GpioConfig {
    pub button_pin: Option<u8>,
}

/// Watches the talk button; each press toggles the conversation.
pub async fn run(
    config: GpioConfig,
    sender: mpsc::Sender<ClientCommand>,
    shutdown: watch::Receiver<bool>,
) {
    if config.button_pin.is_none() {
        return;
    }

    #[cfg(feature = "gpio")]
    {
        use std::time::Duration;

        use rppal::gpio::Gpio;
        use tokio::time;

        let mut shutdown = shutdown;
        let gpio = match Gpio::new() {
            Ok(gpio) => gpio,
            Err(err) => {
                tracing::warn!("gpio unavailable: {}", err);
                return;
            }
        };

        let Some(pin) = config.button_pin else {
            return;
        };
        let button = match gpio.get(pin).map(|p| p.into_input_pullup()) {
            Ok(button) => button,
            Err(err) => {
                tracing::warn!("failed to init button pin {}: {}", pin, err);
                return;
            }
        };
        tracing::info!(pin, "watching talk button");

        let mut last_level = button.read();
        let mut tick = time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    break;
                }
                _ = tick.tick() => {
                    let level = button.read();
                    if level != last_level {
                        last_level = level;
                        if is_press(level) && sender.send(ClientCommand::Toggle).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(feature = "gpio"))]
    {
        let _ = sender;
        let _ = shutdown;
        tracing::info!(
            pin = ?config.button_pin,
            "gpio feature disabled; skipping button watcher"
        );
    }
}

/// The button pulls the line low.
#[cfg(feature = "gpio")]
fn is_press(level: rppal::gpio::Level) -> bool {
    level == rppal::gpio::Level::Low
}
