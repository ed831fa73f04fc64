//! Record injection utility
//!
//! Publishes JSON records to a topic over MQTT v5 so a running engine can be
//! exercised by hand.
//!
//! ## Usage
//!
//! ```bash
//! # One record
//! inject-record --topic orders --payload '{"orderid": 18}'
//!
//! # Keyed record, repeated
//! inject-record --topic orders --payload '{"orderid": 18}' --key 18 --count 5
//!
//! # Bytes that are not JSON, to watch decode failures
//! inject-record --topic orders --payload 'not json' --raw
//! ```

use clap::Parser;
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event};
use serde_json::Value;
use silk_engine::broker::mqtt::{configure_mqtt_options, KEY_PROPERTY};
use silk_engine::config::BrokerSection;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{timeout, Duration};

#[derive(Parser)]
#[command(
    name = "inject-record",
    about = "Publish test records to a topic consumed by silk-engine"
)]
struct Args {
    /// Topic to publish to
    #[arg(long)]
    topic: String,

    /// Record payload
    #[arg(long)]
    payload: String,

    /// Record key, sent as a user property
    #[arg(long)]
    key: Option<String>,

    /// How many copies to publish
    #[arg(long, default_value = "1")]
    count: u32,

    /// Skip JSON validation of the payload
    #[arg(long)]
    raw: bool,

    /// MQTT broker URL
    #[arg(long, env = "BROKER_URL", default_value = "mqtt://localhost:1883")]
    broker_url: String,

    /// Seconds to wait for broker acknowledgements
    #[arg(long, default_value = "10")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = inject(&args).await {
        eprintln!("❌ {e}");
        std::process::exit(1);
    }
}

async fn inject(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if !args.raw {
        serde_json::from_str::<Value>(&args.payload)
            .map_err(|e| format!("payload is not JSON ({e}); pass --raw to send it anyway"))?;
    }

    let broker = BrokerSection {
        url: args.broker_url.clone(),
        ..BrokerSection::default()
    };
    let client_id = format!(
        "inject-record-{}",
        SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis()
    );
    let options = configure_mqtt_options(&client_id, &broker)?;
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    println!("📤 Publishing {} record(s) to {}", args.count, args.topic);
    for _ in 0..args.count {
        let properties = PublishProperties {
            user_properties: args
                .key
                .iter()
                .map(|k| (KEY_PROPERTY.to_string(), k.clone()))
                .collect(),
            ..PublishProperties::default()
        };
        client
            .publish_with_properties(
                args.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                args.payload.clone().into_bytes(),
                properties,
            )
            .await?;
    }

    let mut acked = 0;
    let deadline = Duration::from_secs(args.timeout_secs);
    timeout(deadline, async {
        while acked < args.count {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::PubAck(_))) => acked += 1,
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })
    .await
    .map_err(|_| format!("broker acknowledged {acked}/{} records before timing out", args.count))??;

    client.disconnect().await?;
    println!("✅ {acked} record(s) acknowledged");
    Ok(())
}
