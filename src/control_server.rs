//! Local control socket: one JSON command per line, one JSON reply per line.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::error::ControlClientError;
use crate::orchestrator::Orchestrator;
use crate::protocol::{ClientCommand, ServerReply, StatusSnapshot};

pub async fn bind(bind_addr: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!("control socket listening on {}", bind_addr);
    Ok(listener)
}

pub async fn serve(
    listener: TcpListener,
    client_tx: mpsc::Sender<ClientCommand>,
    status_rx: watch::Receiver<StatusSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                break;
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _)) => {
                        let tx = client_tx.clone();
                        let status = status_rx.clone();
                        tokio::spawn(async move { handle_connection(stream, tx, status).await; });
                    }
                    Err(err) => {
                        tracing::warn!("accept error: {}", err);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    client_tx: mpsc::Sender<ClientCommand>,
    status_rx: watch::Receiver<StatusSnapshot>,
) {
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match serde_json::from_str::<ClientCommand>(&line) {
            Ok(ClientCommand::Status) => {
                let status = status_rx.borrow().clone();
                ServerReply::Status { status }
            }
            Ok(ClientCommand::Ping) => ServerReply::Ok {
                message: "pong".to_string(),
            },
            Ok(command) => match client_tx.send(command).await {
                Ok(()) => ServerReply::Ok {
                    message: "accepted".to_string(),
                },
                Err(_) => ServerReply::Error {
                    message: "device is shutting down".to_string(),
                },
            },
            Err(err) => ServerReply::Error {
                message: format!("invalid command: {}", err),
            },
        };

        let payload = match serde_json::to_string(&reply) {
            Ok(payload) => payload,
            Err(err) => format!("{{\"type\":\"error\",\"message\":\"{}\"}}", err),
        };

        if writer.write_all(payload.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
    }
}

/// Feeds socket and button commands into the control loop until shutdown.
pub async fn dispatch_commands(
    mut commands: mpsc::Receiver<ClientCommand>,
    orchestrator: Orchestrator,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                break;
            }
            command = commands.recv() => {
                match command {
                    Some(command) => apply_command(&orchestrator, command),
                    None => break,
                }
            }
        }
    }
}

pub fn apply_command(orchestrator: &Orchestrator, command: ClientCommand) {
    tracing::debug!(command = ?command, "control command");
    match command {
        ClientCommand::Toggle => orchestrator.toggle_chat_state(),
        ClientCommand::StartListening => orchestrator.start_listening(),
        ClientCommand::StopListening => orchestrator.stop_listening(),
        ClientCommand::WakeWord { text } => orchestrator.wake_word_invoke(text),
        ClientCommand::Ping | ClientCommand::Status => {}
    }
}

/// Sends one command to a running device and waits for its single-line reply.
pub async fn send_command(addr: &str, command: ClientCommand) -> Result<ServerReply, ControlClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ControlClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    let (reader, mut writer) = stream.into_split();

    let mut line = serde_json::to_string(&command)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;

    let mut reply = String::new();
    if BufReader::new(reader).read_line(&mut reply).await? == 0 {
        return Err(ControlClientError::NoReply);
    }
    Ok(serde_json::from_str(&reply)?)
}
