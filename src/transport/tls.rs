//! Broker addressing and TLS transport selection.

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::PathBuf;

use crate::config::MqttSettings;

/// Broker host, port and whether the link is TLS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// PEM material for TLS links. Empty means system roots, no client auth.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key; only ever set together.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let ca = ca_path
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))
            })
            .transpose()?;

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT TLS client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn from_settings(settings: &MqttSettings) -> Result<Self> {
        Self::load(
            settings.tls_ca_path.as_ref(),
            settings.tls_client_cert_path.as_ref(),
            settings.tls_client_key_path.as_ref(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// rumqttc transport for `endpoint`.
    ///
    /// Material on a plain-TCP endpoint is a configuration error, as is a
    /// client certificate without a CA to verify the broker against.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled; \
                     use an mqtts:// broker address or enable use_tls"
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

/// Parse `host:port`, `[v6]:port`, or a `mqtt://`, `tcp://`, `mqtts://`,
/// `ssl://` URL. The TLS schemes force `use_tls`.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
            (host, port)
        }
        None => addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?,
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Reject non-loopback brokers unless remote brokers were allowed.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "MQTT broker must be loopback: {} (set mqtt.allow_remote to override)",
        original
    ))
}
