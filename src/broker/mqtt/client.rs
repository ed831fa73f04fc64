//! I/O side of the MQTT backend: one client and event loop per subscription

use super::connection::{
    configure_mqtt_options, shared_subscription_filter, subscribe_outcome,
    subscription_client_id, ReconnectConfig,
};
use crate::broker::{BrokerError, BrokerRecord, ConsumerClient, Subscription};
use crate::config::BrokerSection;
use crate::message::RecordPosition;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// User property carrying the record key, when publishers set one
pub const KEY_PROPERTY: &str = "key";

const INBOUND_CAPACITY: usize = 256;
const LEAVE_GRACE: Duration = Duration::from_secs(2);

/// What the event loop task reports to its subscription
#[derive(Debug)]
enum Inbound {
    Subscribed(Result<(), String>),
    Record(BrokerRecord, Publish),
    Failed(String),
}

/// Broker client backed by MQTT 5 shared subscriptions
///
/// A consumer group maps to `$share/{group}/{topic}`: the broker delivers
/// each message to one member of the share group. There are no partitions,
/// so every record reports partition 0 and a per-subscription sequence
/// number as its offset.
///
/// Acknowledgements are manual: a QoS 1 publish is acked only when its
/// offset is committed, so records still buffered when the subscription
/// leaves are redelivered by the broker.
#[derive(Debug, Clone)]
pub struct MqttBroker {
    config: BrokerSection,
    reconnect: ReconnectConfig,
}

impl MqttBroker {
    pub fn new(config: BrokerSection) -> Self {
        Self {
            config,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn config(&self) -> &BrokerSection {
        &self.config
    }
}

#[async_trait]
impl ConsumerClient for MqttBroker {
    fn backend(&self) -> &'static str {
        "mqtt"
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let client_id = subscription_client_id(self.config.client_id(), topic);
        let mut options = configure_mqtt_options(&client_id, &self.config)?;
        options.set_manual_acks(true);
        let (client, event_loop) = AsyncClient::new(options, 64);

        let filter = shared_subscription_filter(group_id, topic);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let leaving = Arc::new(AtomicBool::new(false));

        let task = EventLoopTask {
            event_loop,
            client: client.clone(),
            filter: filter.clone(),
            inbound: inbound_tx,
            shutdown: shutdown_rx,
            leaving: leaving.clone(),
            reconnect: self.reconnect.clone(),
        };
        let handle = tokio::spawn(task.run());

        let mut subscription = MqttSubscription {
            topic: topic.to_string(),
            filter,
            client,
            inbound: inbound_rx,
            shutdown: shutdown_tx,
            leaving,
            event_loop: Some(handle),
            unacked: BTreeMap::new(),
            left: false,
        };

        let confirmation = tokio::time::timeout(
            self.config.connect_timeout(),
            await_subscribed(&mut subscription.inbound, topic),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BrokerError::Unreachable(format!(
                "no SubAck from {} within {:?}",
                self.config.url,
                self.config.connect_timeout()
            )))
        });

        match confirmation {
            Ok(()) => {
                info!(topic = %topic, group = %group_id, client_id = %client_id, "MQTT shared subscription established");
                Ok(Box::new(subscription))
            }
            Err(e) => {
                subscription.abort();
                Err(e)
            }
        }
    }
}

/// Wait for the first SubAck or a fatal connection error
async fn await_subscribed(
    inbound: &mut mpsc::Receiver<Inbound>,
    topic: &str,
) -> Result<(), BrokerError> {
    loop {
        match inbound.recv().await {
            Some(Inbound::Subscribed(Ok(()))) => return Ok(()),
            Some(Inbound::Subscribed(Err(reason))) => {
                return Err(BrokerError::Rejected {
                    topic: topic.to_string(),
                    reason,
                })
            }
            Some(Inbound::Failed(reason)) => return Err(BrokerError::Unreachable(reason)),
            Some(Inbound::Record(..)) => continue,
            None => {
                return Err(BrokerError::Unreachable(
                    "event loop ended before subscribing".to_string(),
                ))
            }
        }
    }
}

/// Remove and return every pending publish at or below `offset`
pub fn take_acknowledged(unacked: &mut BTreeMap<i64, Publish>, offset: i64) -> Vec<Publish> {
    let rest = unacked.split_off(&offset.saturating_add(1));
    std::mem::replace(unacked, rest).into_values().collect()
}

/// Convert an incoming publish into a record
pub fn publish_to_record(publish: &Publish, sequence: i64) -> BrokerRecord {
    let key = publish.properties.as_ref().and_then(|props| {
        props
            .user_properties
            .iter()
            .find(|(name, _)| name == KEY_PROPERTY)
            .map(|(_, value)| Bytes::from(value.clone()))
    });

    BrokerRecord {
        topic: String::from_utf8_lossy(&publish.topic).into_owned(),
        partition: 0,
        offset: sequence,
        key,
        payload: publish.payload.clone(),
        timestamp: None,
    }
}

struct EventLoopTask {
    event_loop: EventLoop,
    client: AsyncClient,
    filter: String,
    inbound: mpsc::Sender<Inbound>,
    shutdown: watch::Receiver<bool>,
    leaving: Arc<AtomicBool>,
    reconnect: ReconnectConfig,
}

impl EventLoopTask {
    async fn run(mut self) {
        let mut established = false;
        let mut attempts = 0u32;
        let mut sequence = 0i64;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        debug!(filter = %self.filter, "MQTT event loop shutdown requested");
                        break;
                    }
                }
                event = self.event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        attempts = 0;
                        // Subscriptions do not survive a clean-start reconnect
                        if let Err(e) = self.client.try_subscribe(self.filter.clone(), QoS::AtLeastOnce) {
                            let _ = self.inbound.send(Inbound::Failed(e.to_string())).await;
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(suback))) => {
                        let outcome = subscribe_outcome(&suback.return_codes);
                        if established {
                            if let Err(reason) = outcome {
                                error!(filter = %self.filter, reason = %reason, "Re-subscription refused");
                                let _ = self.inbound.send(Inbound::Failed(reason)).await;
                                break;
                            }
                            info!(filter = %self.filter, "Re-subscribed after reconnect");
                        } else {
                            established = outcome.is_ok();
                            let refused = outcome.is_err();
                            if self.inbound.send(Inbound::Subscribed(outcome)).await.is_err() || refused {
                                break;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let record = publish_to_record(&publish, sequence);
                        sequence += 1;
                        if self.inbound.send(Inbound::Record(record, publish)).await.is_err() {
                            // Closed by leave: keep polling so unsubscribe and
                            // disconnect go out; the unacked publish is redelivered
                            if self.leaving.load(Ordering::SeqCst) {
                                continue;
                            }
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        warn!(filter = %self.filter, "Broker sent disconnect");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.leaving.load(Ordering::SeqCst) {
                            break;
                        }
                        if !established {
                            let _ = self.inbound.send(Inbound::Failed(e.to_string())).await;
                            break;
                        }

                        attempts += 1;
                        if !self.reconnect.allows(attempts) {
                            error!(filter = %self.filter, attempts, error = %e, "Giving up on MQTT reconnection");
                            let _ = self.inbound.send(Inbound::Failed(e.to_string())).await;
                            break;
                        }

                        let delay = self.reconnect.calculate_backoff_delay(attempts);
                        warn!(filter = %self.filter, attempt = attempts, delay_ms = delay, error = %e, "MQTT connection error, reconnecting");
                        if !self.interruptible_sleep(delay).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!(filter = %self.filter, "MQTT event loop stopped");
    }

    /// Returns false if shutdown was requested during the delay
    async fn interruptible_sleep(&mut self, delay_ms: u64) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => !*self.shutdown.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

/// A live shared-subscription membership
pub struct MqttSubscription {
    topic: String,
    filter: String,
    client: AsyncClient,
    inbound: mpsc::Receiver<Inbound>,
    shutdown: watch::Sender<bool>,
    leaving: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
    /// Delivered publishes awaiting a commit, by offset
    unacked: BTreeMap<i64, Publish>,
    left: bool,
}

impl MqttSubscription {
    fn abort(&mut self) {
        self.left = true;
        self.leaving.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Subscription for MqttSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next_record(&mut self) -> Result<Option<BrokerRecord>, BrokerError> {
        if self.left {
            return Err(BrokerError::Closed);
        }

        loop {
            match self.inbound.recv().await {
                Some(Inbound::Record(record, publish)) => {
                    self.unacked.insert(record.offset, publish);
                    return Ok(Some(record));
                }
                Some(Inbound::Subscribed(_)) => continue,
                Some(Inbound::Failed(reason)) => return Err(BrokerError::ConnectionLost(reason)),
                None => return Ok(None),
            }
        }
    }

    /// Ack every delivered publish up to `position`
    async fn commit(&mut self, position: &RecordPosition) -> Result<(), BrokerError> {
        if self.left {
            return Err(BrokerError::Closed);
        }
        for publish in take_acknowledged(&mut self.unacked, position.offset) {
            self.client
                .ack(&publish)
                .await
                .map_err(|e| BrokerError::Commit(e.to_string()))?;
        }
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), BrokerError> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        self.leaving.store(true, Ordering::SeqCst);

        // Unblock the event loop if it is waiting on a full channel;
        // buffered and uncommitted publishes stay unacked
        self.inbound.close();
        let unacked = self.unacked.len();
        self.unacked.clear();
        if unacked > 0 {
            debug!(filter = %self.filter, unacked, "Leaving with uncommitted records");
        }

        if let Err(e) = self.client.unsubscribe(self.filter.clone()).await {
            warn!(filter = %self.filter, error = %e, "Unsubscribe request failed");
        }
        if let Err(e) = self.client.disconnect().await {
            warn!(filter = %self.filter, error = %e, "Disconnect request failed");
        }

        if let Some(mut handle) = self.event_loop.take() {
            if tokio::time::timeout(LEAVE_GRACE, &mut handle).await.is_err() {
                warn!(filter = %self.filter, "MQTT event loop did not stop in time, aborting");
                let _ = self.shutdown.send(true);
                handle.abort();
            }
        }

        info!(topic = %self.topic, filter = %self.filter, "Left MQTT share group");
        Ok(())
    }
}

impl Drop for MqttSubscription {
    fn drop(&mut self) {
        if !self.left {
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::PublishProperties;

    #[test]
    fn test_publish_to_record_without_key() {
        let publish = Publish::new("orders", QoS::AtLeastOnce, r#"{"orderid": 18}"#, None);
        let record = publish_to_record(&publish, 7);

        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, 0);
        assert_eq!(record.offset, 7);
        assert!(record.key.is_none());
        assert_eq!(record.payload, Bytes::from_static(br#"{"orderid": 18}"#));
    }

    #[test]
    fn test_publish_to_record_reads_key_property() {
        let properties = PublishProperties {
            user_properties: vec![(KEY_PROPERTY.to_string(), "18".to_string())],
            ..PublishProperties::default()
        };
        let publish = Publish::new("orders", QoS::AtLeastOnce, "{}", Some(properties));

        let record = publish_to_record(&publish, 0);
        assert_eq!(record.key, Some(Bytes::from_static(b"18")));
    }

    #[test]
    fn test_take_acknowledged_returns_committed_prefix() {
        let mut unacked = BTreeMap::new();
        for offset in 0..5 {
            let publish = Publish::new("orders", QoS::AtLeastOnce, format!("{offset}"), None);
            unacked.insert(offset, publish);
        }

        let acked = take_acknowledged(&mut unacked, 2);
        let payloads: Vec<_> = acked.iter().map(|p| p.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![Bytes::from("0"), Bytes::from("1"), Bytes::from("2")]
        );
        assert_eq!(unacked.keys().copied().collect::<Vec<_>>(), vec![3, 4]);

        assert!(take_acknowledged(&mut unacked, 1).is_empty());
        assert_eq!(take_acknowledged(&mut unacked, 10).len(), 2);
        assert!(unacked.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_to_unreachable_broker_fails() {
        let config = BrokerSection {
            url: "mqtt://127.0.0.1:1".to_string(),
            connect_timeout_secs: 2,
            ..BrokerSection::default()
        };
        let broker = MqttBroker::new(config);

        let result = broker.subscribe("orders", "g").await;
        assert!(matches!(result, Err(BrokerError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_connecting() {
        let config = BrokerSection {
            url: "not a url".to_string(),
            ..BrokerSection::default()
        };
        let result = MqttBroker::new(config).subscribe("orders", "g").await;
        assert!(matches!(result, Err(BrokerError::InvalidUrl(_))));
    }
}
