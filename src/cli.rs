use clap::{Parser, Subcommand};

use crate::config::DeviceConfig;
use crate::protocol::ClientCommand;

#[derive(Parser, Debug)]
#[command(name = "voxcore", version, about = "Voice assistant device runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Run the device: audio, version check, transport and control socket")]
    Device {
        #[arg(long, default_value_t = DeviceConfig::default_bind())]
        bind: String,
        #[arg(long, value_name = "websocket|mqtt")]
        transport: Option<String>,
        #[arg(long)]
        websocket_url: Option<String>,
        #[arg(long)]
        ota_url: Option<String>,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        realtime: bool,
        #[arg(long, value_name = "DIR")]
        assets: Option<String>,
        #[arg(long)]
        gpio_button: Option<u8>,
    },
    Client {
        #[arg(long, default_value_t = DeviceConfig::default_bind())]
        addr: String,
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClientAction {
    Ping,
    #[command(about = "Fetch device state, listening mode and channel status")]
    Status,
    #[command(about = "Toggle the conversation, like a button press")]
    Toggle,
    #[command(about = "Push-to-talk: listen until stop-listening")]
    StartListening,
    StopListening,
    #[command(about = "Behave as if the wake word was heard")]
    WakeWord { text: String },
}

impl From<ClientAction> for ClientCommand {
    fn from(action: ClientAction) -> Self {
        match action {
            ClientAction::Ping => ClientCommand::Ping,
            ClientAction::Status => ClientCommand::Status,
            ClientAction::Toggle => ClientCommand::Toggle,
            ClientAction::StartListening => ClientCommand::StartListening,
            ClientAction::StopListening => ClientCommand::StopListening,
            ClientAction::WakeWord { text } => ClientCommand::WakeWord { text },
        }
    }
}
