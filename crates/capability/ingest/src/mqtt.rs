//! rumqttc 实现：TLS（校验/不校验）、认证、订阅确认。

use crate::{BrokerConnector, BrokerSession, Inbound, IngestError};
use async_trait::async_trait;
use domain::{BridgeConfig, TlsMode};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeFilter, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 请求通道容量（订阅/取消订阅/断开）。
const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// rumqttc 连接器。
#[derive(Debug, Clone)]
pub struct MqttConnector {
    keepalive: Duration,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(keepalive: Duration, connect_timeout: Duration) -> Self {
        Self {
            keepalive,
            connect_timeout,
        }
    }

    fn options(&self, config: &BridgeConfig) -> Result<MqttOptions, IngestError> {
        let client_id = effective_client_id(&config.client_id);
        let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
        options.set_keep_alive(self.keepalive);
        options.set_clean_session(true);
        if config.has_credentials() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }
        match config.tls_mode {
            TlsMode::Disabled => {}
            TlsMode::Secure => {
                let path = config.ca_cert_path.as_deref().unwrap_or_default();
                let ca = std::fs::read(path)
                    .map_err(|err| IngestError::Tls(format!("read ca cert {}: {}", path, err)))?;
                options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                }));
            }
            TlsMode::Insecure => {
                warn!(
                    target: "ems.ingest",
                    endpoint = %config.endpoint(),
                    "tls_verification_disabled"
                );
                options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                    Arc::new(insecure_client_config()),
                )));
            }
        }
        Ok(options)
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, config: &BridgeConfig) -> Result<Box<dyn BrokerSession>, IngestError> {
        let options = self.options(config)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let qos = qos_from_u8(config.qos);
        let filters: Vec<SubscribeFilter> = config
            .topic_patterns
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), qos))
            .collect();

        let mut early = VecDeque::new();
        let handshake = handshake(&client, &mut eventloop, filters, &mut early);
        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(IngestError::Timeout(self.connect_timeout)),
        }
        Ok(Box::new(MqttSession {
            client,
            eventloop,
            topics: config.topic_patterns.clone(),
            early,
        }))
    }
}

/// 等待 CONNACK，发出订阅，再等待 SUBACK。
async fn handshake(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    filters: Vec<SubscribeFilter>,
    early: &mut VecDeque<Inbound>,
) -> Result<(), IngestError> {
    let topics: Vec<String> = filters.iter().map(|filter| filter.path.clone()).collect();
    let mut filters = Some(filters);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(IngestError::Refused(format!("{:?}", ack.code)));
                }
                if let Some(filters) = filters.take() {
                    client
                        .subscribe_many(filters)
                        .await
                        .map_err(|err| IngestError::Connection(err.to_string()))?;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected: Vec<&str> = ack
                    .return_codes
                    .iter()
                    .zip(topics.iter())
                    .filter(|(code, _)| matches!(code, SubscribeReasonCode::Failure))
                    .map(|(_, topic)| topic.as_str())
                    .collect();
                if !rejected.is_empty() {
                    return Err(IngestError::SubscribeRejected(rejected.join(",")));
                }
                return Ok(());
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => early.push_back(Inbound {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(_) => {}
            Err(err) => return Err(classify(err)),
        }
    }
}

fn classify(err: ConnectionError) -> IngestError {
    match err {
        ConnectionError::Tls(err) => IngestError::Tls(err.to_string()),
        ConnectionError::ConnectionRefused(code) => IngestError::Refused(format!("{:?}", code)),
        other => IngestError::Connection(other.to_string()),
    }
}

struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    topics: Vec<String>,
    /// 握手期间提前到达的消息。
    early: VecDeque<Inbound>,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn next_message(&mut self) -> Result<Inbound, IngestError> {
        if let Some(inbound) = self.early.pop_front() {
            return Ok(inbound);
        }
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Inbound {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(IngestError::Closed("broker sent disconnect".to_string()));
                }
                Ok(_) => {}
                Err(err) => return Err(classify(err)),
            }
        }
    }

    async fn disconnect(&mut self) {
        let client = &self.client;
        let topics = &self.topics;
        let eventloop = &mut self.eventloop;
        let graceful = tokio::time::timeout(DISCONNECT_TIMEOUT, async move {
            let requests = async {
                for topic in topics {
                    client.unsubscribe(topic.clone()).await?;
                }
                client.disconnect().await
            };
            tokio::pin!(requests);
            // 请求通道有界，发送期间必须同时驱动 eventloop
            let mut sent = false;
            loop {
                tokio::select! {
                    result = &mut requests, if !sent => {
                        sent = true;
                        if let Err(err) = result {
                            debug!(target: "ems.ingest", error = %err, "disconnect_request_failed");
                            return;
                        }
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => return,
                        Ok(_) => {}
                    },
                }
            }
        })
        .await;
        if graceful.is_err() {
            debug!(target: "ems.ingest", "disconnect_timed_out");
        }
    }
}

/// 配置表中的 QoS → rumqttc QoS（非法值已被校验拒绝，这里兜底为 1）。
pub fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// 空 clientId 时生成 `ems-bridge-<uuid>`。
pub fn effective_client_id(client_id: &str) -> String {
    let client_id = client_id.trim();
    if client_id.is_empty() {
        format!("ems-bridge-{}", uuid::Uuid::new_v4())
    } else {
        client_id.to_string()
    }
}

fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
}

/// tlsInsecure：不校验服务端证书。
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }

    #[test]
    fn blank_client_id_is_generated() {
        assert_eq!(effective_client_id("bridge-1"), "bridge-1");
        let generated = effective_client_id("  ");
        assert!(generated.starts_with("ems-bridge-"));
        assert_ne!(generated, effective_client_id(""));
    }

    #[tokio::test]
    async fn disconnect_with_many_topics_is_bounded() {
        let options = MqttOptions::new("ems-bridge-test", "127.0.0.1", 1);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let mut session = MqttSession {
            client,
            eventloop,
            topics: (0..REQUEST_CAPACITY + 6)
                .map(|i| format!("bacnet/device-{}/#", i))
                .collect(),
            early: VecDeque::new(),
        };
        let finished =
            tokio::time::timeout(DISCONNECT_TIMEOUT * 2, session.disconnect()).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn missing_ca_file_is_a_tls_error() {
        let connector = MqttConnector::new(Duration::from_secs(60), Duration::from_secs(1));
        let config = BridgeConfig {
            broker: "localhost".to_string(),
            tls_mode: TlsMode::Secure,
            ca_cert_path: Some("/nonexistent/ems-bridge/ca.pem".to_string()),
            enabled: true,
            ..BridgeConfig::default()
        };
        let err = match connector.connect(&config).await {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, IngestError::Tls(_)));
    }
}
