use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::AudioPacket;
use crate::config::MqttSettings;
use crate::error::TransportError;
use crate::protocol::{OutboundMessage, ServerHello, UdpParams};
use crate::transport::crypto::{AudioCipher, SequenceCheck, SequenceTracker};
use crate::transport::{
    ChannelStatus, HANDSHAKE_TIMEOUT, Session, Transport, TransportEventSink, dispatch_text,
    report_error,
};

const PROTOCOL_VERSION: u32 = 3;
const TRANSPORT_NAME: &str = "udp";
const KEEP_ALIVE: Duration = Duration::from_secs(90);
const REQUEST_CAPACITY: usize = 10;
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
const MAX_DATAGRAM: usize = 2048;

struct Link {
    client: AsyncClient,
    poller: JoinHandle<()>,
}

struct AudioChannel {
    cipher: AudioCipher,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for AudioChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Control messages over MQTT, audio over AES-CTR encrypted UDP.
pub struct MqttTransport {
    settings: MqttSettings,
    fallback_client_id: String,
    runtime: Handle,
    sink: Arc<dyn TransportEventSink>,
    status: Arc<ChannelStatus>,
    session: Session,
    connected: Arc<AtomicBool>,
    hello_tx: crossbeam_channel::Sender<ServerHello>,
    hello_rx: crossbeam_channel::Receiver<ServerHello>,
    link: Option<Link>,
    channel: Option<AudioChannel>,
}

impl MqttTransport {
    pub fn new(
        settings: MqttSettings,
        fallback_client_id: String,
        runtime: Handle,
        sink: Arc<dyn TransportEventSink>,
    ) -> Self {
        let (hello_tx, hello_rx) = crossbeam_channel::bounded(1);
        Self {
            settings,
            fallback_client_id,
            runtime,
            sink,
            status: Arc::new(ChannelStatus::default()),
            session: Session::default(),
            connected: Arc::new(AtomicBool::new(false)),
            hello_tx,
            hello_rx,
            link: None,
            channel: None,
        }
    }

    fn start_client(&mut self, report: bool) -> bool {
        if let Some(link) = self.link.take() {
            tracing::warn!("mqtt client already started; restarting");
            link.poller.abort();
        }
        self.connected.store(false, Ordering::SeqCst);

        if self.settings.endpoint.is_empty() {
            tracing::warn!("mqtt endpoint is not specified");
            if report {
                report_error(&self.status, self.sink.as_ref(), "server not found");
            }
            return false;
        }

        let (host, port) = self.settings.host_port();
        let client_id = if self.settings.client_id.is_empty() {
            self.fallback_client_id.clone()
        } else {
            self.settings.client_id.clone()
        };
        let mut options = MqttOptions::new(client_id, host.clone(), port);
        options.set_keep_alive(KEEP_ALIVE);
        if !self.settings.username.is_empty() {
            options.set_credentials(self.settings.username.clone(), self.settings.password.clone());
        }
        if self.settings.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (connack_tx, connack_rx) = crossbeam_channel::bounded(1);
        let poller = self.runtime.spawn(poll_loop(
            eventloop,
            client.clone(),
            self.settings.subscribe_topic.clone(),
            PollContext {
                sink: self.sink.clone(),
                status: self.status.clone(),
                connected: self.connected.clone(),
                hello: self.hello_tx.clone(),
                connack: connack_tx,
            },
        ));
        self.link = Some(Link { client, poller });

        tracing::info!("connecting to endpoint {}:{}", host, port);
        if connack_rx.recv_timeout(HANDSHAKE_TIMEOUT).is_err() {
            tracing::error!("failed to connect to endpoint");
            report_error(&self.status, self.sink.as_ref(), "server not connected");
            return false;
        }
        tracing::info!("connected to endpoint");
        true
    }

    fn open_udp(&self, udp: &UdpParams) -> Result<AudioChannel, TransportError> {
        let cipher = AudioCipher::from_hex(&udp.key, &udp.nonce)?;
        let target = (udp.server.clone(), udp.port);
        let socket = self
            .runtime
            .block_on(async move {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(target).await?;
                Ok::<_, std::io::Error>(socket)
            })
            .map_err(|err| TransportError::Connect(format!("udp: {}", err)))?;
        let socket = Arc::new(socket);

        let reader = self.runtime.spawn(udp_reader(
            socket.clone(),
            cipher.clone(),
            self.sink.clone(),
            self.status.clone(),
        ));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let writer = self
            .runtime
            .spawn(udp_writer(socket, outgoing_rx, self.status.clone()));
        tracing::info!("udp audio channel to {}:{}", udp.server, udp.port);
        Ok(AudioChannel {
            cipher,
            outgoing,
            reader,
            writer,
        })
    }
}

struct PollContext {
    sink: Arc<dyn TransportEventSink>,
    status: Arc<ChannelStatus>,
    connected: Arc<AtomicBool>,
    hello: crossbeam_channel::Sender<ServerHello>,
    connack: crossbeam_channel::Sender<()>,
}

async fn poll_loop(mut eventloop: EventLoop, client: AsyncClient, subscribe_topic: String, ctx: PollContext) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                ctx.connected.store(true, Ordering::SeqCst);
                if !subscribe_topic.is_empty() {
                    if let Err(err) = client.try_subscribe(subscribe_topic.clone(), QoS::AtMostOnce) {
                        tracing::warn!("subscribe to {} failed: {}", subscribe_topic, err);
                    }
                }
                let _ = ctx.connack.try_send(());
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match std::str::from_utf8(&publish.payload) {
                    Ok(text) => dispatch_text(text, ctx.sink.as_ref(), &ctx.hello),
                    Err(_) => tracing::warn!("non-utf8 payload on {}", publish.topic),
                }
                ctx.status.mark_incoming();
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("disconnected from endpoint");
                ctx.connected.store(false, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(err) => {
                if ctx.connected.swap(false, Ordering::SeqCst) {
                    tracing::info!("disconnected from endpoint: {}", err);
                } else {
                    tracing::debug!("mqtt connection error: {}", err);
                }
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        }
    }
}

/// Validates, sequences and decrypts one datagram.
fn receive_datagram(cipher: &AudioCipher, tracker: &mut SequenceTracker, data: &[u8]) -> Option<Vec<u8>> {
    let (sequence, payload) = match cipher.open(data) {
        Ok(opened) => opened,
        Err(err) => {
            tracing::error!("{}", err);
            return None;
        }
    };
    match tracker.accept(sequence) {
        SequenceCheck::InOrder => {}
        SequenceCheck::Gap { expected } => {
            tracing::warn!(seq = sequence, expected, "audio packet sequence gap");
        }
        SequenceCheck::Stale => {
            tracing::warn!(
                seq = sequence,
                last = tracker.remote_sequence(),
                "stale audio packet dropped"
            );
            return None;
        }
    }
    Some(payload)
}

async fn udp_reader(
    socket: Arc<UdpSocket>,
    cipher: AudioCipher,
    sink: Arc<dyn TransportEventSink>,
    status: Arc<ChannelStatus>,
) {
    let mut tracker = SequenceTracker::default();
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match socket.recv(&mut buffer).await {
            Ok(len) => len,
            Err(err) => {
                tracing::warn!("udp receive failed: {}", err);
                break;
            }
        };
        if let Some(payload) = receive_datagram(&cipher, &mut tracker, &buffer[..len]) {
            sink.on_audio(payload);
            status.mark_incoming();
        }
    }
}

/// Sends sealed frames in order; each frame keeps the channel busy until the
/// socket has taken it.
async fn udp_writer(
    socket: Arc<UdpSocket>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    status: Arc<ChannelStatus>,
) {
    while let Some(datagram) = outgoing.recv().await {
        if let Err(err) = socket.send(&datagram).await {
            tracing::debug!("udp send dropped: {}", err);
        }
        status.end_send();
    }
}

impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn start(&mut self) -> bool {
        self.start_client(false)
    }

    fn open_audio_channel(&mut self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::info!("mqtt is not connected, try to connect now");
            if !self.start_client(true) {
                return false;
            }
        }

        self.status.reset();
        self.session.clear();
        while self.hello_rx.try_recv().is_ok() {}

        let hello = OutboundMessage::hello(PROTOCOL_VERSION, TRANSPORT_NAME).to_json();
        if !self.send_text(&hello) {
            return false;
        }

        let server_hello = match self.hello_rx.recv_timeout(HANDSHAKE_TIMEOUT) {
            Ok(server_hello) => server_hello,
            Err(_) => {
                tracing::error!("failed to receive server hello");
                report_error(&self.status, self.sink.as_ref(), "server timeout");
                return false;
            }
        };
        if let Err(err) = self.session.apply_hello(&server_hello, TRANSPORT_NAME) {
            report_error(&self.status, self.sink.as_ref(), &err.to_string());
            return false;
        }
        let Some(udp) = server_hello.udp.as_ref() else {
            report_error(&self.status, self.sink.as_ref(), "udp is not specified");
            return false;
        };

        self.channel = None;
        match self.open_udp(udp) {
            Ok(channel) => {
                self.channel = Some(channel);
                true
            }
            Err(err) => {
                report_error(&self.status, self.sink.as_ref(), &err.to_string());
                false
            }
        }
    }

    fn close_audio_channel(&mut self) {
        self.channel = None;
        let goodbye = OutboundMessage::goodbye(&self.session.session_id).to_json();
        self.send_text(&goodbye);
        self.session.clear();
        self.sink.on_channel_closed();
    }

    fn send_audio(&mut self, packet: AudioPacket) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let datagram = match channel.cipher.seal(&packet) {
            Ok(datagram) => datagram,
            Err(err) => {
                tracing::warn!("audio frame dropped: {}", err);
                return;
            }
        };
        self.status.begin_send();
        if channel.outgoing.send(datagram).is_err() {
            tracing::debug!("udp writer gone; audio dropped");
            self.status.end_send();
        }
    }

    fn send_text(&mut self, text: &str) -> bool {
        if self.settings.publish_topic.is_empty() {
            return false;
        }
        let Some(link) = &self.link else {
            return false;
        };
        if let Err(err) = link.client.try_publish(
            self.settings.publish_topic.clone(),
            QoS::AtMostOnce,
            false,
            text.as_bytes().to_vec(),
        ) {
            tracing::error!("failed to publish message {}: {}", text, err);
            report_error(&self.status, self.sink.as_ref(), "server error");
            return false;
        }
        true
    }

    fn link_connected(&self) -> bool {
        self.channel.is_some()
    }

    fn status(&self) -> &Arc<ChannelStatus> {
        &self.status
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.channel = None;
        if let Some(link) = self.link.take() {
            link.poller.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use crate::transport::crypto::{AUDIO_PACKET_TYPE, NONCE_LEN};

    fn cipher() -> AudioCipher {
        let mut prefix = [0u8; NONCE_LEN];
        prefix[0] = AUDIO_PACKET_TYPE;
        AudioCipher::new([3u8; 16], prefix)
    }

    #[test]
    fn datagrams_are_sequenced_before_delivery() {
        let mut server = cipher();
        let receiver = cipher();
        let mut tracker = SequenceTracker::default();

        let first = server.seal(b"one").unwrap();
        let second = server.seal(b"two").unwrap();
        let _lost = server.seal(b"three").unwrap();
        let fourth = server.seal(b"four").unwrap();

        assert_eq!(receive_datagram(&receiver, &mut tracker, &first), Some(b"one".to_vec()));
        assert_eq!(receive_datagram(&receiver, &mut tracker, &second), Some(b"two".to_vec()));
        assert_eq!(receive_datagram(&receiver, &mut tracker, &fourth), Some(b"four".to_vec()));
        assert_eq!(receive_datagram(&receiver, &mut tracker, &second), None);
        assert_eq!(tracker.remote_sequence(), 4);
        assert_eq!(receive_datagram(&receiver, &mut tracker, &[0u8; 4]), None);
    }

    #[test]
    fn udp_reader_delivers_decrypted_audio() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (device, server) = runtime.block_on(async {
            let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            device.connect(server.local_addr().unwrap()).await.unwrap();
            server.connect(device.local_addr().unwrap()).await.unwrap();
            (device, server)
        });
        let sink = Arc::new(RecordingSink::default());
        let status = Arc::new(ChannelStatus::default());
        runtime.spawn(udp_reader(Arc::new(device), cipher(), sink.clone(), status));

        let mut sender = cipher();
        runtime.block_on(async {
            server.send(&sender.seal(b"frame-1").unwrap()).await.unwrap();
            server.send(&sender.seal(b"frame-2").unwrap()).await.unwrap();
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sink.audio().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sink.audio(), vec![b"frame-1".to_vec(), b"frame-2".to_vec()]);
    }

    #[test]
    fn audio_frames_hold_busy_until_sent_and_close_clears_session() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let server = runtime
            .block_on(UdpSocket::bind("127.0.0.1:0"))
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut transport = MqttTransport::new(
            MqttSettings::default(),
            "device".into(),
            runtime.handle().clone(),
            sink.clone(),
        );
        let key = "03030303030303030303030303030303";
        let nonce = "01000000000000000000000000000000";
        let channel = transport
            .open_udp(&UdpParams {
                server: "127.0.0.1".into(),
                port: server.local_addr().unwrap().port(),
                key: key.into(),
                nonce: nonce.into(),
            })
            .unwrap();
        transport.channel = Some(channel);
        transport.session.session_id = "sess-7".into();
        transport.session.server_sample_rate = 16_000;

        transport.send_audio(b"frame-1".to_vec());
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let len = runtime
            .block_on(async {
                tokio::time::timeout(Duration::from_secs(5), server.recv_from(&mut buffer)).await
            })
            .unwrap()
            .unwrap()
            .0;
        let receiver = AudioCipher::from_hex(key, nonce).unwrap();
        assert_eq!(receiver.open(&buffer[..len]).unwrap(), (1, b"frame-1".to_vec()));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while transport.is_audio_channel_busy() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!transport.is_audio_channel_busy());

        transport.close_audio_channel();
        assert_eq!(transport.session_id(), "");
        assert_eq!(
            transport.server_sample_rate(),
            crate::transport::DEFAULT_SERVER_SAMPLE_RATE
        );
        assert!(!transport.is_audio_channel_opened());
        assert_eq!(sink.closed(), 1);
    }

    #[test]
    fn open_without_endpoint_reports_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut transport = MqttTransport::new(
            MqttSettings::default(),
            "device".into(),
            runtime.handle().clone(),
            sink.clone(),
        );
        assert!(!transport.start());
        assert!(sink.errors().is_empty());
        assert!(!transport.open_audio_channel());
        assert_eq!(sink.errors(), vec!["server not found".to_string()]);
        assert!(!transport.is_audio_channel_opened());
    }
}
