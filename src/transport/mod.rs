//! MQTT transport: broker addressing, TLS selection, publish and subscribe.

mod mqtt;
mod tls;

pub use mqtt::{connect_mqtt, resolve_endpoint, run_subscriber, MqttChannel};
pub use tls::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials};
