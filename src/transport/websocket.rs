use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::audio::AudioPacket;
use crate::config::WebsocketSettings;
use crate::error::TransportError;
use crate::protocol::{OutboundMessage, ServerHello};
use crate::transport::{
    ChannelStatus, HANDSHAKE_TIMEOUT, Session, Transport, TransportEventSink, dispatch_text,
    report_error,
};

const PROTOCOL_VERSION: u32 = 1;
const TRANSPORT_NAME: &str = "websocket";

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    hello: crossbeam_channel::Receiver<ServerHello>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Queues a goodbye and a close frame, then stops reading.
    fn shutdown(self, goodbye: Option<String>) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.abort();
        if let Some(goodbye) = goodbye {
            let _ = self.outgoing.send(Message::text(goodbye));
        }
        let _ = self.outgoing.send(Message::Close(None));
    }
}

/// Control JSON and binary audio over one websocket.
pub struct WebsocketTransport {
    settings: WebsocketSettings,
    device_id: String,
    client_id: String,
    runtime: Handle,
    sink: Arc<dyn TransportEventSink>,
    status: Arc<ChannelStatus>,
    session: Session,
    connection: Option<Connection>,
}

impl WebsocketTransport {
    pub fn new(
        settings: WebsocketSettings,
        device_id: String,
        client_id: String,
        runtime: Handle,
        sink: Arc<dyn TransportEventSink>,
    ) -> Self {
        Self {
            settings,
            device_id,
            client_id,
            runtime,
            sink,
            status: Arc::new(ChannelStatus::default()),
            session: Session::default(),
            connection: None,
        }
    }

    fn connect(&self) -> Result<Connection, TransportError> {
        let mut request = self
            .settings
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let headers = request.headers_mut();
        for (name, value) in [
            ("Authorization", format!("Bearer {}", self.settings.token)),
            ("Protocol-Version", PROTOCOL_VERSION.to_string()),
            ("Device-Id", self.device_id.clone()),
            ("Client-Id", self.client_id.clone()),
        ] {
            let value = HeaderValue::from_str(&value)
                .map_err(|err| TransportError::Connect(format!("invalid {} header: {}", name, err)))?;
            headers.insert(name, value);
        }

        tracing::info!(url = %self.settings.url, "connecting websocket");
        let (stream, _) = self
            .runtime
            .block_on(async { tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request)).await })
            .map_err(|_| TransportError::Connect("connect timed out".into()))?
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut write, read) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer_status = self.status.clone();
        self.runtime.spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                let audio = matches!(message, Message::Binary(_));
                let sent = write.send(message).await;
                if audio {
                    writer_status.end_send();
                }
                if let Err(err) = sent {
                    tracing::warn!("websocket send failed: {}", err);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let connected = Arc::new(AtomicBool::new(true));
        let (hello_tx, hello) = crossbeam_channel::bounded(1);
        let reader = self.runtime.spawn(read_loop(
            read,
            self.sink.clone(),
            self.status.clone(),
            connected.clone(),
            hello_tx,
        ));

        Ok(Connection {
            outgoing,
            connected,
            hello,
            reader,
        })
    }
}

async fn read_loop(
    mut read: WsRead,
    sink: Arc<dyn TransportEventSink>,
    status: Arc<ChannelStatus>,
    connected: Arc<AtomicBool>,
    hello: crossbeam_channel::Sender<ServerHello>,
) {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                dispatch_text(text.as_str(), sink.as_ref(), &hello);
                status.mark_incoming();
            }
            Ok(Message::Binary(data)) => {
                sink.on_audio(data.to_vec());
                status.mark_incoming();
            }
            Ok(Message::Close(frame)) => {
                tracing::info!("websocket closed by peer: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!("websocket receive failed: {}", err);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    tracing::info!("websocket disconnected");
    sink.on_channel_closed();
}

impl Transport for WebsocketTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn start(&mut self) -> bool {
        true
    }

    fn open_audio_channel(&mut self) -> bool {
        if let Some(previous) = self.connection.take() {
            previous.shutdown(None);
        }
        self.status.reset();
        self.session.clear();

        let connection = match self.connect() {
            Ok(connection) => connection,
            Err(err) => {
                report_error(&self.status, self.sink.as_ref(), &format!("server not found: {}", err));
                return false;
            }
        };
        let hello_rx = connection.hello.clone();
        self.connection = Some(connection);

        let hello = OutboundMessage::hello(PROTOCOL_VERSION, TRANSPORT_NAME).to_json();
        if !self.send_text(&hello) {
            return false;
        }

        let server_hello = match hello_rx.recv_timeout(HANDSHAKE_TIMEOUT) {
            Ok(server_hello) => server_hello,
            Err(_) => {
                let err = TransportError::HandshakeTimeout(HANDSHAKE_TIMEOUT);
                report_error(&self.status, self.sink.as_ref(), &err.to_string());
                return false;
            }
        };
        if let Err(err) = self.session.apply_hello(&server_hello, TRANSPORT_NAME) {
            report_error(&self.status, self.sink.as_ref(), &err.to_string());
            return false;
        }
        tracing::info!(
            sample_rate = self.session.server_sample_rate,
            frame_duration = self.session.server_frame_duration_ms,
            "websocket audio channel opened"
        );
        true
    }

    fn close_audio_channel(&mut self) {
        if let Some(connection) = self.connection.take() {
            let goodbye = OutboundMessage::goodbye(&self.session.session_id).to_json();
            connection.shutdown(Some(goodbye));
        }
        self.session.clear();
        self.sink.on_channel_closed();
    }

    fn send_audio(&mut self, packet: AudioPacket) {
        let Some(connection) = &self.connection else {
            return;
        };
        self.status.begin_send();
        if connection.outgoing.send(Message::binary(packet)).is_err() {
            tracing::debug!("websocket writer gone; audio dropped");
            self.status.end_send();
        }
    }

    fn send_text(&mut self, text: &str) -> bool {
        let Some(connection) = &self.connection else {
            return false;
        };
        if connection.outgoing.send(Message::text(text.to_string())).is_err() {
            tracing::error!("failed to send text: {}", text);
            report_error(&self.status, self.sink.as_ref(), "server error");
            return false;
        }
        true
    }

    fn link_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|connection| connection.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn status(&self) -> &Arc<ChannelStatus> {
        &self.status
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for WebsocketTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AbortReason, ListeningMode};
    use crate::testing::RecordingSink;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn spawn_server(
        runtime: &tokio::runtime::Runtime,
        session_id: Option<&'static str>,
    ) -> (String, crossbeam_channel::Receiver<Value>) {
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        runtime.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => {
                        let value: Value = serde_json::from_str(text.as_str()).unwrap();
                        if value["type"] == "hello" {
                            let mut reply = json!({
                                "type": "hello",
                                "transport": "websocket",
                                "audio_params": {"sample_rate": 16000, "frame_duration": 60},
                            });
                            if let Some(id) = session_id {
                                reply["session_id"] = json!(id);
                            }
                            ws.send(Message::text(reply.to_string())).await.unwrap();
                            ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
                        }
                        seen_tx.send(value).unwrap();
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        (format!("ws://{}/", addr), seen_rx)
    }

    fn transport(
        runtime: &tokio::runtime::Runtime,
        url: String,
        sink: Arc<RecordingSink>,
    ) -> WebsocketTransport {
        WebsocketTransport::new(
            WebsocketSettings {
                url,
                token: "secret".into(),
            },
            "02:00:00:00:00:01".into(),
            "client-1".into(),
            runtime.handle().clone(),
            sink,
        )
    }

    #[test]
    fn handshake_attaches_session_id_to_later_messages() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (url, seen) = spawn_server(&runtime, Some("sess-42"));
        let sink = Arc::new(RecordingSink::default());
        let mut transport = transport(&runtime, url, sink.clone());

        assert!(transport.open_audio_channel());
        assert_eq!(transport.session_id(), "sess-42");
        assert_eq!(transport.server_sample_rate(), 16_000);
        assert_eq!(transport.server_frame_duration(), 60);
        assert!(transport.is_audio_channel_opened());

        transport.send_start_listening(ListeningMode::AutoStop);
        transport.send_abort_speaking(AbortReason::WakeWordDetected);

        let wait = Duration::from_secs(5);
        let hello = seen.recv_timeout(wait).unwrap();
        assert_eq!(hello["transport"], "websocket");
        assert_eq!(hello["audio_params"]["sample_rate"], 16000);

        let listen = seen.recv_timeout(wait).unwrap();
        assert_eq!(listen["type"], "listen");
        assert_eq!(listen["session_id"], "sess-42");
        assert_eq!(listen["mode"], "auto");

        let abort = seen.recv_timeout(wait).unwrap();
        assert_eq!(abort["session_id"], "sess-42");
        assert_eq!(abort["reason"], "wake_word_detected");

        let deadline = std::time::Instant::now() + wait;
        while sink.audio().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sink.audio(), vec![vec![1u8, 2, 3]]);

        transport.send_audio(vec![9u8; 4]);
        let deadline = std::time::Instant::now() + wait;
        while transport.is_audio_channel_busy() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!transport.is_audio_channel_busy());

        transport.close_audio_channel();
        let goodbye = seen.recv_timeout(wait).unwrap();
        assert_eq!(goodbye["type"], "goodbye");
        assert_eq!(goodbye["session_id"], "sess-42");
        assert!(!transport.is_audio_channel_opened());
        assert!(sink.closed() >= 1);
        assert_eq!(transport.session_id(), "");
        assert_eq!(
            transport.server_sample_rate(),
            crate::transport::DEFAULT_SERVER_SAMPLE_RATE
        );
    }

    #[test]
    fn unreachable_server_reports_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = Arc::new(RecordingSink::default());
        let mut transport = transport(&runtime, format!("ws://{}/", addr), sink.clone());
        assert!(!transport.open_audio_channel());
        assert!(!transport.is_audio_channel_opened());
        assert_eq!(sink.errors().len(), 1);
        assert!(!transport.send_text("{}"));
    }
}
