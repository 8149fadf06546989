use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tracing::{debug, info, warn};

use frostwatch_common::{
    LinkAction, LinkHealth, LinkSupervisor, NodeConfig, NodeTopics, SensorPayload, SensorReading,
    StatusBlinker,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NodeConfig::default();
    let topics = NodeTopics::new(&config.base, &config.area);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(config.broker.host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.broker.port);

    let mut mqtt_options = MqttOptions::new("frostwatch-node-sim", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(config.broker.username.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(config.broker.password.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);
    let broker_up = Arc::new(AtomicBool::new(false));

    {
        let broker_up = broker_up.clone();
        let mqtt = mqtt.clone();
        let subscription = topics.subscription.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("broker connected");
                        broker_up.store(true, Ordering::Relaxed);
                        if let Err(err) = mqtt.subscribe(subscription.as_str(), QoS::AtMostOnce).await
                        {
                            warn!("subscribe failed: {err}");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        // Nothing consumes inbound traffic; log it like the device does.
                        info!(
                            "message on {}: {}",
                            message.topic,
                            String::from_utf8_lossy(&message.payload)
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        broker_up.store(false, Ordering::Relaxed);
                        warn!("mqtt poll error: {err}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    let mut supervisor = LinkSupervisor::new(config.connectivity.clone(), config.blink.clone());
    let mut blinker = StatusBlinker::new(supervisor.blink_pattern(), monotonic_ms());
    let mut reading = SensorReading::default();
    let mut sim_tick: u64 = 0;

    info!("node simulator started; publishing to {}", topics.sensors);

    let mut interval = tokio::time::interval(Duration::from_millis(100));

    loop {
        interval.tick().await;
        let now_ms = monotonic_ms();

        let health = LinkHealth {
            // Off-device there is no station link to lose.
            wifi_up: true,
            broker_up: broker_up.load(Ordering::Relaxed),
        };

        let actions = supervisor.tick(health, now_ms);

        blinker.set_pattern(supervisor.blink_pattern());
        if let Some(level) = blinker.tick(now_ms) {
            debug!("status led {}", if level { "on" } else { "off" });
        }

        for action in actions {
            match action {
                LinkAction::ConnectWifi => {
                    info!("wifi reconnect requested (no station off-device)");
                }
                LinkAction::ConnectBroker => {
                    // rumqttc re-dials on the next event-loop poll; the
                    // attempt still counts against the reboot ceiling.
                    info!(
                        "broker reconnect attempt {} of {}",
                        supervisor.retry_count(),
                        config.connectivity.max_retries_before_reboot,
                    );
                }
                LinkAction::PublishReadings => {
                    sim_tick = sim_tick.saturating_add(1);
                    // Hardware integration point:
                    // replace these simulated readings with the DS18B20 probe on the ESP target.
                    reading.temperature_c = -18.0 + ((sim_tick % 8) as f32 * 0.2);
                    reading.supply_volts = 3.1;

                    let payload = SensorPayload::from_reading(&reading).to_json()?;
                    info!("publishing {payload}");
                    mqtt.publish(topics.sensors.as_str(), QoS::AtMostOnce, true, payload)
                        .await
                        .context("failed to publish sensor readings")?;
                }
                LinkAction::RefreshDisplay => {
                    // Stands in for the OLED redraw.
                    info!(
                        "[{}] Temp = {:.2}  Volts = {:.2}",
                        supervisor.state().as_str(),
                        reading.temperature_c,
                        reading.supply_volts,
                    );
                }
                LinkAction::Restart => {
                    warn!(
                        "retry ceiling exceeded after {} attempts; restarting",
                        supervisor.retry_count()
                    );
                    anyhow::bail!("device restart requested by connectivity supervisor");
                }
            }
        }
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
