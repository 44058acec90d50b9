//! MQTT telemetry channel and subscriber.

use anyhow::{anyhow, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, ClientError, Connection, Event, Incoming, MqttOptions};
use rumqttc::Outgoing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::tls::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials};
use crate::config::MqttSettings;
use crate::telemetry::MessageChannel;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_QUEUE: usize = 10;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Resolve the broker endpoint and TLS material from settings.
pub fn resolve_endpoint(settings: &MqttSettings) -> Result<(MqttEndpoint, TlsMaterials)> {
    let endpoint = parse_mqtt_endpoint(&settings.broker_addr, settings.use_tls)?;
    if !settings.allow_remote {
        validate_loopback_addr(&endpoint, &settings.broker_addr)?;
    }
    let tls = TlsMaterials::from_settings(settings)?;
    Ok((endpoint, tls))
}

/// Open a client and its connection; nothing is sent until the connection
/// is driven.
pub fn connect_mqtt(settings: &MqttSettings, client_id: &str) -> Result<(Client, Connection)> {
    let (endpoint, tls) = resolve_endpoint(settings)?;
    let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = settings.username.as_deref() {
        options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
    }
    options.set_transport(tls.build_transport(&endpoint)?);

    let (client, connection) = Client::new(options, REQUEST_QUEUE);
    log::info!(
        "MQTT client {} -> {}:{} (TLS: {}, auth: {})",
        client_id,
        endpoint.host,
        endpoint.port,
        endpoint.use_tls,
        settings.username.is_some()
    );
    Ok((client, connection))
}

/// QoS 1 publisher with a background thread driving the connection.
///
/// Publishing never blocks: when the request queue is full (broker down or
/// slow) the message is rejected and the caller decides what to do with it.
pub struct MqttChannel {
    client: Client,
    stop: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttChannel {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let (client, connection) = connect_mqtt(settings, &settings.client_id)?;
        let stop = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        let driver_stop = Arc::clone(&stop);
        let driver_closing = Arc::clone(&closing);
        let driver = std::thread::Builder::new()
            .name("mqtt-driver".to_string())
            .spawn(move || drive_connection(connection, &driver_stop, &driver_closing))?;
        Ok(Self {
            client,
            stop,
            closing,
            driver: Mutex::new(Some(driver)),
        })
    }
}

fn drive_connection(mut connection: Connection, stop: &AtomicBool, closing: &AtomicBool) {
    for event in connection.iter() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match event {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) if closing.load(Ordering::SeqCst) => {
                log::warn!("MQTT connection error while closing: {}", e);
                break;
            }
            Err(e) => {
                log::warn!("MQTT connection error: {}; retrying", e);
                let until = Instant::now() + RECONNECT_DELAY;
                while Instant::now() < until
                    && !stop.load(Ordering::SeqCst)
                    && !closing.load(Ordering::SeqCst)
                {
                    std::thread::sleep(POLL_SLICE);
                }
            }
        }
    }
}

impl MessageChannel for MqttChannel {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        match self
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
        {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => Err(anyhow!(
                "MQTT request queue full ({} pending); message dropped",
                REQUEST_QUEUE
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Queue a disconnect behind pending publishes and wait, bounded, for the
    /// driver to flush them.
    fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::warn!("MQTT disconnect not queued: {}", e);
        }
        let Some(handle) = self
            .driver
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        else {
            return Ok(());
        };
        let deadline = Instant::now() + CLOSE_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(POLL_SLICE);
        }
        if handle.is_finished() {
            let _ = handle.join();
            Ok(())
        } else {
            self.stop.store(true, Ordering::SeqCst);
            Err(anyhow!(
                "MQTT driver still busy after {:?}; pending messages may be lost",
                CLOSE_TIMEOUT
            ))
        }
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Subscribe to `topic` and hand every publish to `handler`, reconnecting on
/// connection errors. Returns once `running` is cleared.
pub fn run_subscriber<F>(
    settings: &MqttSettings,
    client_id: &str,
    topic: &str,
    running: &AtomicBool,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str, &[u8]),
{
    while running.load(Ordering::SeqCst) {
        let (client, mut connection) = connect_mqtt(settings, client_id)?;
        client.subscribe(topic, QoS::AtLeastOnce)?;
        log::info!("subscribed to {}", topic);

        for event in connection.iter() {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    match std::str::from_utf8(&publish.topic) {
                        Ok(source) => handler(source, &publish.payload[..]),
                        Err(e) => log::warn!("skipping publish with invalid topic: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("MQTT connection error: {}; reconnecting", e);
                    break;
                }
            }
        }
        let _ = client.disconnect();
        if running.load(Ordering::SeqCst) {
            std::thread::sleep(RECONNECT_DELAY);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(addr: &str) -> MqttSettings {
        MqttSettings {
            broker_addr: addr.to_string(),
            client_id: "edgelensd".to_string(),
            allow_remote: false,
            use_tls: false,
            tls_ca_path: None,
            tls_client_cert_path: None,
            tls_client_key_path: None,
            username: None,
            password: None,
        }
    }

    #[test]
    fn remote_broker_requires_opt_in() {
        assert!(resolve_endpoint(&settings("10.0.0.5:1883")).is_err());
        let mut allowed = settings("10.0.0.5:1883");
        allowed.allow_remote = true;
        let (endpoint, _) = resolve_endpoint(&allowed).unwrap();
        assert_eq!(endpoint.host, "10.0.0.5");
    }

    #[test]
    fn publishes_fail_fast_when_broker_is_down() {
        let channel = MqttChannel::connect(&settings("127.0.0.1:1")).unwrap();
        let started = Instant::now();
        let rejected = (0..30)
            .filter(|_| channel.publish("devices/lens-01/infer", b"{}").is_err())
            .count();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(rejected > 0);

        let closing = Instant::now();
        let _ = channel.close();
        assert!(closing.elapsed() < CLOSE_TIMEOUT + Duration::from_secs(1));
    }

    #[test]
    fn loopback_broker_resolves() {
        let (endpoint, tls) = resolve_endpoint(&settings("mqtt://127.0.0.1:1883")).unwrap();
        assert_eq!(endpoint.port, 1883);
        assert!(!endpoint.use_tls);
        assert!(!tls.is_configured());
    }
}
