//! Broker address parsing and TLS transport selection.

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

/// Where the broker lives and whether to speak TLS to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// PEM material for a TLS connection to the broker.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// Custom CA bundle. `None` means the built-in web roots.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = ca_path
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT CA '{}'", path.display()))
            })
            .transpose()?;

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("MQTT client certificate provided without key")),
            (None, Some(_)) => return Err(anyhow!("MQTT client key provided without certificate")),
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

impl MqttEndpoint {
    /// Pick the rumqttc transport for this endpoint.
    pub fn transport(&self, tls: &TlsMaterials) -> Result<Transport> {
        if !self.use_tls {
            if tls.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS material configured but {}:{} is not a TLS endpoint \
                     (use the mqtts:// scheme or enable use_tls)",
                    self.host,
                    self.port
                ));
            }
            return Ok(Transport::tcp());
        }
        if !tls.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = tls
            .ca
            .clone()
            .ok_or_else(|| anyhow!("MQTT client certificates require a CA bundle"))?;
        Ok(Transport::tls(ca, tls.client_auth.clone(), None))
    }
}

/// Accepts `host:port`, `[v6]:port` and the `mqtt`, `tcp`, `mqtts`, `ssl` schemes.
pub fn parse_mqtt_endpoint(addr: &str, force_tls: bool) -> Result<MqttEndpoint> {
    let mut use_tls = force_tls;
    let mut rest = addr.trim();

    if let Some((scheme, tail)) = rest.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        rest = tail;
    }

    let (host, port) = split_host_port(rest)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = match addr.strip_prefix('[') {
        Some(bracketed) => {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
            (host, port)
        }
        None => addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?,
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}
