use crate::config::{BrokerConfig, Credentials, TlsVersion, TransportKind, PLAINTEXT_PORT};
use crate::models::InboundEvent;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    Publish, QoS, TlsConfiguration, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

static TLS12_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("MQTT client is not connected")]
    NotConnected,
    #[error("Connection to {broker} failed: {reason}")]
    Connect { broker: String, reason: String },
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    pub ca_path: PathBuf,
    pub version: TlsVersion,
}

/// Everything needed to open a broker session, derived once from configuration.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub tls: Option<TlsParams>,
    pub credentials: Option<Credentials>,
    pub qos: QoS,
    pub retain: bool,
    pub sync_connect: bool,
    pub keep_alive: Duration,
    pub publish_base: String,
    pub subscribe_base: String,
}

fn qos_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

impl ConnectionParams {
    pub fn derive(config: &BrokerConfig) -> Self {
        let transport = config.transport;
        let (host, port) = (config.host.clone(), config.port);
        let client_id = config.client_id.clone();

        // TLS is only considered off the plaintext port.
        let tls = match (&config.tls_ca_path, config.tls_version) {
            (_, TlsVersion::None) => None,
            _ if port == PLAINTEXT_PORT => None,
            (Some(ca_path), version) => Some(TlsParams {
                ca_path: ca_path.clone(),
                version,
            }),
            (None, _) => None,
        };

        Self {
            transport,
            host,
            port,
            client_id,
            tls,
            credentials: config.credentials.clone(),
            qos: qos_level(config.qos),
            retain: config.retain,
            sync_connect: config.sync_connect,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            publish_base: config.publish_topic_base.clone(),
            subscribe_base: config.subscribe_topic_base.clone(),
        }
    }

    pub fn publish_topic(&self, item: &str) -> String {
        format!("{}{}", self.publish_base, item)
    }

    pub fn subscribe_topic(&self, item: &str) -> String {
        format!("{}{}", self.subscribe_base, item)
    }

    pub fn wildcard_topic(&self) -> String {
        self.subscribe_topic("#")
    }

    fn broker_label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn mqtt_options(&self) -> Result<MqttOptions, BridgeError> {
        let broker_addr = match self.transport {
            TransportKind::Tcp => self.host.clone(),
            TransportKind::Websockets => {
                let scheme = if self.tls.is_some() { "wss" } else { "ws" };
                format!("{}://{}:{}/mqtt", scheme, self.host, self.port)
            }
        };

        let mut options = MqttOptions::new(self.client_id.as_str(), broker_addr, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        if let Some(credentials) = &self.credentials {
            options.set_credentials(credentials.username.as_str(), credentials.password.as_str());
        }

        let transport = match (self.transport, &self.tls) {
            (TransportKind::Tcp, None) => Transport::Tcp,
            (TransportKind::Tcp, Some(tls)) => Transport::Tls(tls_configuration(tls)?),
            (TransportKind::Websockets, None) => Transport::Ws,
            (TransportKind::Websockets, Some(tls)) => Transport::Wss(tls_configuration(tls)?),
        };
        options.set_transport(transport);

        Ok(options)
    }
}

fn tls_configuration(tls: &TlsParams) -> Result<TlsConfiguration, BridgeError> {
    let pem = std::fs::read(&tls.ca_path)
        .map_err(|e| BridgeError::Tls(format!("{}: {}", tls.ca_path.display(), e)))?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| BridgeError::Tls(format!("{}: {}", tls.ca_path.display(), e)))?;
        roots
            .add(cert)
            .map_err(|e| BridgeError::Tls(e.to_string()))?;
    }

    let versions = match tls.version {
        TlsVersion::V1_2 => TLS12_ONLY,
        TlsVersion::V1_3 | TlsVersion::None => TLS13_ONLY,
    };

    let config = rustls::ClientConfig::builder_with_protocol_versions(versions)
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Event loop side of a session: connection callbacks and inbound dispatch.
struct SessionLoop {
    client: AsyncClient,
    state: Arc<watch::Sender<ClientState>>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    wildcard: String,
    qos: QoS,
}

impl SessionLoop {
    fn on_connect(&self, ack: &ConnAck) {
        if ack.code != ConnectReturnCode::Success {
            error!("MQTT broker refused the connection: {:?}", ack.code);
            self.state
                .send_replace(ClientState::Error(format!("{:?}", ack.code)));
            return;
        }

        info!("Connected to MQTT broker (session present: {}).", ack.session_present);
        self.state.send_replace(ClientState::Connected);

        // The event loop is the caller here, so the request must not wait on it.
        match self.client.try_subscribe(self.wildcard.as_str(), self.qos) {
            Ok(_) => info!("Subscribed to '{}'.", self.wildcard),
            Err(e) => error!("Failed to subscribe to '{}': {}", self.wildcard, e),
        }
    }

    fn on_message(&self, publish: Publish) {
        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
        debug!("Message arrived on '{}': {}", publish.topic, payload);

        let event = InboundEvent {
            topic: publish.topic,
            payload,
        };
        if self.inbound.send(event).is_err() {
            debug!("Inbound listener is gone, dropping message.");
        }
    }

    /// Waits for the broker's answer to the initial connect.
    async fn await_connack(&self, eventloop: &mut EventLoop, broker: &str) -> Result<(), BridgeError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    self.on_connect(&ack);
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(BridgeError::Connect {
                            broker: broker.to_string(),
                            reason: format!("{:?}", code),
                        }),
                    };
                }
                Ok(event) => debug!("Event before ConnAck: {:?}", event),
                Err(e) => {
                    error!("Connection to MQTT broker {} failed: {}", broker, e);
                    self.state.send_replace(ClientState::Error(e.to_string()));
                    return Err(BridgeError::Connect {
                        broker: broker.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn run(self, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => self.on_connect(&ack),
                Ok(Event::Incoming(Packet::Publish(publish))) => self.on_message(publish),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the session.");
                    self.state.send_replace(ClientState::Disconnected);
                    break;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent.");
                    self.state.send_replace(ClientState::Disconnected);
                    break;
                }
                Ok(event) => debug!("Unhandled event: {:?}", event),
                Err(e) => {
                    error!("Error in MQTT event loop: {}", e);
                    let failed_early = *self.state.borrow() == ClientState::Connecting;
                    self.state.send_replace(if failed_early {
                        ClientState::Error(e.to_string())
                    } else {
                        ClientState::Disconnected
                    });
                    // No automatic reconnect.
                    break;
                }
            }
        }
    }
}

/// Owns the single broker session of the process.
pub struct MessageBridge {
    params: ConnectionParams,
    client: Option<AsyncClient>,
    state: Arc<watch::Sender<ClientState>>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    event_loop: Option<JoinHandle<()>>,
}

impl MessageBridge {
    pub fn new(params: ConnectionParams, inbound: mpsc::UnboundedSender<InboundEvent>) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            params,
            client: None,
            state: Arc::new(state),
            inbound,
            event_loop: None,
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ClientState::Connected
    }

    /// Watch handle for connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Opens the session. A synchronous connect waits for the broker's ConnAck
    /// and reports failure; an asynchronous one returns immediately and reports
    /// through the log and [`ClientState`].
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        if self.client.is_some() {
            warn!("MQTT session already started, ignoring connect.");
            return Ok(());
        }

        let broker = self.params.broker_label();
        debug!("Configuring MQTT broker at {}...", broker);

        let options = self.params.mqtt_options().map_err(|e| {
            error!("Cannot build connection for {}: {}", broker, e);
            self.state.send_replace(ClientState::Error(e.to_string()));
            e
        })?;

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        self.state.send_replace(ClientState::Connecting);

        let session = SessionLoop {
            client: client.clone(),
            state: self.state.clone(),
            inbound: self.inbound.clone(),
            wildcard: self.params.wildcard_topic(),
            qos: self.params.qos,
        };

        if self.params.sync_connect {
            info!("Connecting to MQTT broker {} (blocking)...", broker);
            // A failed handshake leaves no session behind, so connect may be retried.
            session.await_connack(&mut eventloop, &broker).await?;
        } else {
            info!("Connecting to MQTT broker {} in the background...", broker);
        }

        self.client = Some(client);
        self.event_loop = Some(tokio::spawn(session.run(eventloop)));
        Ok(())
    }

    /// Publishes `payload` to `publish_base + item` with the configured QoS and retain flag.
    pub async fn publish(&self, item: &str, payload: &str) -> Result<(), BridgeError> {
        let topic = self.params.publish_topic(item);

        let client = match &self.client {
            Some(client) if self.is_connected() => client,
            _ => {
                error!("MQTT client is not connected, dropping '{}' for '{}'.", payload, topic);
                return Err(BridgeError::NotConnected);
            }
        };

        match client
            .publish(topic.as_str(), self.params.qos, self.params.retain, payload)
            .await
        {
            Ok(_) => {
                info!("Message published to '{}': {}", topic, payload);
                Ok(())
            }
            Err(e) => {
                error!("Failed to publish message to '{}': {:?}", topic, e);
                Err(e.into())
            }
        }
    }

    pub async fn subscribe(&self, items: &[&str]) -> Result<(), BridgeError> {
        let client = self.client.as_ref().ok_or(BridgeError::NotConnected)?;
        for item in items {
            let topic = self.params.subscribe_topic(item);
            client.subscribe(topic.as_str(), self.params.qos).await?;
            info!("Subscribed to '{}'.", topic);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, items: &[&str]) -> Result<(), BridgeError> {
        let client = self.client.as_ref().ok_or(BridgeError::NotConnected)?;
        for item in items {
            let topic = self.params.subscribe_topic(item);
            client.unsubscribe(topic.as_str()).await?;
            info!("Unsubscribed from '{}'.", topic);
        }
        Ok(())
    }

    /// Closes the session. Safe to call repeatedly and without a prior connect.
    pub async fn disconnect(&mut self) {
        let Some(client) = self.client.take() else {
            debug!("MQTT session not open, nothing to disconnect.");
            self.state.send_replace(ClientState::Disconnected);
            return;
        };

        if self.is_connected() {
            if let Err(e) = client.disconnect().await {
                warn!("Failed to send disconnect: {}", e);
            }
        }

        if let Some(mut handle) = self.event_loop.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        self.state.send_replace(ClientState::Disconnected);
        info!("Disconnected from MQTT broker {}.", self.params.broker_label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".into(),
            port: PLAINTEXT_PORT,
            transport: TransportKind::Tcp,
            client_id: "pepper-test".into(),
            tls_version: TlsVersion::None,
            tls_ca_path: None,
            credentials: None,
            qos: 0,
            retain: false,
            sync_connect: true,
            keep_alive_secs: 5,
            publish_topic_base: "openhab/in/".into(),
            subscribe_topic_base: "openhab/out/".into(),
        }
    }

    fn bridge(config: &BrokerConfig) -> (MessageBridge, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MessageBridge::new(ConnectionParams::derive(config), tx), rx)
    }

    #[test]
    fn tls_is_ignored_on_plaintext_port() {
        let mut config = broker_config();
        config.tls_version = TlsVersion::V1_2;
        config.tls_ca_path = Some("/etc/ca.pem".into());

        assert_eq!(ConnectionParams::derive(&config).tls, None);

        config.port = 8883;
        assert_eq!(
            ConnectionParams::derive(&config).tls,
            Some(TlsParams {
                ca_path: "/etc/ca.pem".into(),
                version: TlsVersion::V1_2
            })
        );
    }

    #[test]
    fn derives_qos_auth_and_topics() {
        let mut config = broker_config();
        config.qos = 2;
        config.retain = true;
        config.credentials = Credentials::resolve(Some("pepper".into()), Some("pw".into()));

        let params = ConnectionParams::derive(&config);
        assert_eq!(params.qos, QoS::ExactlyOnce);
        assert!(params.retain);
        assert_eq!(params.credentials.as_ref().map(|c| c.username.as_str()), Some("pepper"));
        assert_eq!(params.publish_topic("Beamer"), "openhab/in/Beamer");
        assert_eq!(params.wildcard_topic(), "openhab/out/#");
        assert_eq!(params.keep_alive, Duration::from_secs(5));
    }

    #[test]
    fn missing_ca_file_fails_option_building() {
        let mut config = broker_config();
        config.port = 8883;
        config.tls_version = TlsVersion::V1_3;
        config.tls_ca_path = Some("/definitely/not/here.pem".into());

        let err = ConnectionParams::derive(&config).mqtt_options().unwrap_err();
        assert!(matches!(err, BridgeError::Tls(_)));
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_reported_not_raised() {
        let (bridge, _rx) = bridge(&broker_config());
        let result = bridge.publish("Beamer", "ON").await;
        assert!(matches!(result, Err(BridgeError::NotConnected)));
        assert_eq!(bridge.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn subscriptions_need_an_open_session() {
        let (bridge, _rx) = bridge(&broker_config());
        assert!(matches!(
            bridge.subscribe(&["Conf_Window_1"]).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            bridge.unsubscribe(&["Conf_Window_1"]).await,
            Err(BridgeError::NotConnected)
        ));
        assert_eq!(bridge.params().subscribe_topic("Conf_Window_1"), "openhab/out/Conf_Window_1");
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_a_no_op() {
        let (mut bridge, _rx) = bridge(&broker_config());
        bridge.disconnect().await;
        bridge.disconnect().await;
        assert_eq!(bridge.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn blocking_connect_to_closed_port_fails_and_stays_disconnected() {
        let mut config = broker_config();
        config.port = 1;
        let (mut bridge, _rx) = bridge(&config);

        let result = bridge.connect().await;
        assert!(matches!(result, Err(BridgeError::Connect { .. })));
        assert!(!bridge.is_connected());
        assert!(matches!(bridge.publish("x", "y").await, Err(BridgeError::NotConnected)));

        bridge.disconnect().await;
        bridge.disconnect().await;
        assert_eq!(bridge.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn failed_blocking_connect_can_be_retried() {
        let mut config = broker_config();
        config.port = 1;
        let (mut bridge, _rx) = bridge(&config);

        assert!(matches!(bridge.connect().await, Err(BridgeError::Connect { .. })));
        // No half-open session may swallow the second attempt.
        assert!(matches!(bridge.connect().await, Err(BridgeError::Connect { .. })));
        assert!(matches!(bridge.state(), ClientState::Error(_)));
        assert!(matches!(
            bridge.subscribe(&["Conf_Window_1"]).await,
            Err(BridgeError::NotConnected)
        ));
    }

    /// Reads one MQTT control packet: (first header byte, body).
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let (mut len, mut shift) = (0usize, 0);
        loop {
            let byte = stream.read_u8().await.unwrap();
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    /// Splits a length-prefixed UTF-8 string off the front of `body`.
    fn take_str(body: &[u8]) -> (String, &[u8]) {
        let len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let text = String::from_utf8(body[2..2 + len].to_vec()).unwrap();
        (text, &body[2 + len..])
    }

    #[tokio::test]
    async fn connected_session_subscribes_and_forwards_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = broker_config();
        config.port = listener.local_addr().unwrap().port();
        config.qos = 1;

        // Minimal broker: accept, ack, check the wildcard subscription, push one
        // message and capture the client's publish.
        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let (header, _) = read_packet(&mut stream).await;
            assert_eq!(header >> 4, 1, "expected CONNECT");
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let (header, body) = read_packet(&mut stream).await;
            assert_eq!(header, 0x82, "expected SUBSCRIBE");
            let (filter, rest) = take_str(&body[2..]);
            let subscription = (filter, rest[0]);
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x01])
                .await
                .unwrap();

            let topic = b"openhab/out/state/Conf_Window_1";
            let payload = b"OPEN";
            let mut publish = vec![0x30, (2 + topic.len() + payload.len()) as u8, 0x00];
            publish.push(topic.len() as u8);
            publish.extend_from_slice(topic);
            publish.extend_from_slice(payload);
            stream.write_all(&publish).await.unwrap();

            let (header, body) = read_packet(&mut stream).await;
            assert_eq!(header >> 4, 3, "expected PUBLISH");
            let (topic, rest) = take_str(&body);
            // QoS 1 carries a packet id before the payload.
            stream
                .write_all(&[0x40, 0x02, rest[0], rest[1]])
                .await
                .unwrap();
            let published = (topic, String::from_utf8(rest[2..].to_vec()).unwrap());

            (subscription, published, stream)
        });

        let (mut bridge, mut rx) = bridge(&config);
        bridge.connect().await.unwrap();
        assert!(bridge.is_connected());

        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            inbound,
            InboundEvent {
                topic: "openhab/out/state/Conf_Window_1".into(),
                payload: "OPEN".into(),
            }
        );

        bridge.publish("Beamer", "ON").await.unwrap();

        let (subscription, published, _stream) =
            tokio::time::timeout(Duration::from_secs(5), broker)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(subscription, ("openhab/out/#".to_string(), 1));
        assert_eq!(published, ("openhab/in/Beamer".to_string(), "ON".to_string()));

        bridge.disconnect().await;
        assert_eq!(bridge.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn background_connect_returns_immediately() {
        let mut config = broker_config();
        config.port = 1;
        config.sync_connect = false;
        let (mut bridge, _rx) = bridge(&config);
        let mut state = bridge.subscribe_state();

        assert!(bridge.connect().await.is_ok());

        // The event loop reports the failure on its own.
        let reported = tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| matches!(s, ClientState::Error(_))),
        )
        .await
        .map(|seen| seen.is_ok())
        .unwrap_or(false);
        assert!(reported);
        assert!(!bridge.is_connected());
        bridge.disconnect().await;
    }
}
