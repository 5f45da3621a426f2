//! WireGuard configuration file parser
//!
//! Parses standard WireGuard `.conf` files with [Interface] and [Peer] sections.
//! Only the keys the peer core acts on are kept; interface addressing and
//! routing keys are accepted and ignored.

use std::net::SocketAddr;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroizing;

use crate::crypto::{PrivateKey, PublicKey};
use crate::error::ConfigError;

/// Complete WireGuard configuration
#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Clone)]
pub struct InterfaceConfig {
    /// Our private key (32 bytes)
    pub private_key: PrivateKey,
    /// Listen port (optional, for servers)
    pub listen_port: Option<u16>,
}

impl std::fmt::Debug for InterfaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceConfig")
            .field("listen_port", &self.listen_port)
            .finish_non_exhaustive()
    }
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's public key (32 bytes)
    pub public_key: PublicKey,
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (IP:port)
    pub endpoint: Option<SocketAddr>,
    /// Keepalive interval in seconds (optional)
    pub persistent_keepalive: Option<u16>,
    /// Ignore source addresses of authenticated packets
    pub disable_roaming: bool,
}

impl WireGuardConfig {
    /// Parse a WireGuard configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a WireGuard configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceBuilder> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;

        // Temporary storage for current peer being parsed
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Check for section headers
            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            }

            // Parse key = value pairs
            let (key, value) = match line.split_once('=') {
                Some(pair) => pair,
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: format!("Expected 'key = value', got: {}", line),
                    })
                }
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(InterfaceBuilder::default);

                    match key.as_str() {
                        "privatekey" => {
                            iface.private_key = Some(Zeroizing::new(parse_key(value, "PrivateKey")?));
                        }
                        "listenport" => {
                            iface.listen_port = Some(value.parse().map_err(|_| {
                                ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid ListenPort: {}", value),
                                }
                            })?);
                        }
                        _ => {
                            // Address, DNS, MTU and friends belong to the interface owner
                            tracing::debug!("Ignoring interface key: {}", key);
                        }
                    }
                }
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key = Some(parse_key(value, "PublicKey")?);
                        }
                        "presharedkey" => {
                            peer.preshared_key = Some(parse_key(value, "PresharedKey")?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(parse_endpoint(value)?);
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive = Some(parse_keepalive(value, line_num)?);
                        }
                        "disableroaming" => {
                            peer.disable_roaming = parse_bool(value, line_num)?;
                        }
                        _ => {
                            tracing::debug!("Ignoring peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        // Save any pending peer
        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let interface = interface
            .ok_or(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            })?
            .build()?;

        Ok(WireGuardConfig { interface, peers })
    }

    /// Get our public key derived from the private key
    pub fn public_key(&self) -> PublicKey {
        crate::crypto::x25519::public_key(&self.interface.private_key)
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<PrivateKey>,
    listen_port: Option<u16>,
}

impl InterfaceBuilder {
    fn build(self) -> Result<InterfaceConfig, ConfigError> {
        let private_key = self.private_key.ok_or(ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        })?;

        Ok(InterfaceConfig {
            private_key,
            listen_port: self.listen_port,
        })
    }
}

/// Builder for PeerConfig during parsing
#[derive(Default)]
struct PeerBuilder {
    public_key: Option<PublicKey>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    persistent_keepalive: Option<u16>,
    disable_roaming: bool,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            persistent_keepalive: self.persistent_keepalive,
            disable_roaming: self.disable_roaming,
        })
    }
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| ConfigError::InvalidKey {
            field: field_name.to_string(),
        })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Parse an endpoint (IP:port)
fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    // Hostnames are resolved by whoever hands us the config
    value
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidAddress {
            value: value.to_string(),
        })
}

/// Parse a keepalive interval; "off" means disabled
fn parse_keepalive(value: &str, line: usize) -> Result<u16, ConfigError> {
    if value.eq_ignore_ascii_case("off") {
        return Ok(0);
    }
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid PersistentKeepalive: {}", value),
    })
}

fn parse_bool(value: &str, line: usize) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::ParseError {
            line,
            message: format!("Invalid boolean: {}", value),
        }),
    }
}
