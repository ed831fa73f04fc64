//! Pure connection configuration for the MQTT backend

use crate::broker::BrokerError;
use crate::config::BrokerSection;
use rumqttc::v5::mqttbytes::v5::SubscribeReasonCode;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Reconnection backoff once a subscription is established
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay used after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Whether attempt number `attempt` is still allowed
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// MQTT 5 shared subscription filter that realises a consumer group
pub fn shared_subscription_filter(group_id: &str, topic: &str) -> String {
    format!("$share/{group_id}/{topic}")
}

/// Client id unique per subscription so one process can hold several
pub fn subscription_client_id(prefix: &str, topic: &str) -> String {
    let topic: String = topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{prefix}-{topic}-{millis}")
}

/// Build client options from the broker section
pub fn configure_mqtt_options(
    client_id: &str,
    config: &BrokerSection,
) -> Result<MqttOptions, BrokerError> {
    let url = Url::parse(&config.url).map_err(|_| BrokerError::InvalidUrl(config.url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| BrokerError::InvalidUrl(config.url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        options.set_transport(Transport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        options.set_credentials(username, password);
    }

    options.set_keep_alive(Duration::from_secs(60));
    options.set_max_packet_size(Some(256 * 1024));

    Ok(options)
}

/// Interpret a SubAck: every requested filter must be granted
pub fn subscribe_outcome(codes: &[SubscribeReasonCode]) -> Result<(), String> {
    if codes.is_empty() {
        return Err("empty SubAck".to_string());
    }

    match codes
        .iter()
        .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
    {
        Some(code) => Err(format!("broker refused subscription: {code:?}")),
        None => Ok(()),
    }
}
