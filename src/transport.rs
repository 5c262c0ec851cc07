//! Delivery of resolved commands.
//!
//! Protocol fragments go to the server as `slim.request` JSON-RPC calls on
//! behalf of the local player; script bindings are run as child processes.
//! Both calls block until done.

use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

use crate::discovery::ServerLocation;
use crate::error::TransportError;

/// Request id sent with every JSON-RPC call.
const REQUEST_ID: i32 = 1;
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub trait CommandTransport {
    fn send(&mut self, fragment: &str, server: &ServerLocation) -> Result<(), TransportError>;
}

pub trait ScriptRunner {
    fn run(&mut self, script: &Path) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// JSON-RPC over HTTP to `/jsonrpc.js`.
pub struct JsonRpcTransport {
    client: Client,
    player_id: String,
    credentials: Option<Credentials>,
}

impl JsonRpcTransport {
    pub fn new(player_id: String, credentials: Option<Credentials>) -> Result<Self, TransportError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        info!(player = %player_id, "Server communication initialized");
        Ok(JsonRpcTransport {
            client,
            player_id,
            credentials,
        })
    }

    pub fn request_body(&self, fragment: &str) -> Result<Value, TransportError> {
        let params: Value = serde_json::from_str(fragment).map_err(TransportError::InvalidFragment)?;
        Ok(json!({
            "id": REQUEST_ID,
            "method": "slim.request",
            "params": [self.player_id, params],
        }))
    }
}

impl CommandTransport for JsonRpcTransport {
    fn send(&mut self, fragment: &str, server: &ServerLocation) -> Result<(), TransportError> {
        let (Some(host), Some(port)) = (server.host(), server.port()) else {
            return Err(TransportError::NoServer);
        };
        let url = format!("http://{host}:{port}/jsonrpc.js");
        let body = self.request_body(fragment)?;
        debug!(%url, %body, "Server command");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        debug!(reply = %response.text().unwrap_or_default(), "Server reply");
        Ok(())
    }
}

/// Runs script bindings directly and waits for them.
#[derive(Debug, Default)]
pub struct ProcessScriptRunner;

impl ScriptRunner for ProcessScriptRunner {
    fn run(&mut self, script: &Path) -> Result<(), TransportError> {
        info!(script = %script.display(), "Running script");
        let status = Command::new(script).status().map_err(TransportError::Script)?;
        if status.success() {
            Ok(())
        } else {
            Err(TransportError::ScriptFailed(status))
        }
    }
}

/// Player MAC address used as the JSON-RPC player id.
///
/// Same lookup order as squeezelite: the `UTMAC` override, then the first
/// network interface with a non-zero hardware address.
pub fn find_mac() -> Option<String> {
    if let Ok(utmac) = std::env::var("UTMAC") {
        if let Some(mac) = normalize_mac(&utmac) {
            return Some(mac);
        }
    }

    let mut interfaces: Vec<_> = fs::read_dir("/sys/class/net").ok()?.flatten().collect();
    interfaces.sort_by_key(|entry| entry.file_name());
    interfaces
        .iter()
        .filter(|entry| entry.file_name() != "lo")
        .filter_map(|entry| fs::read_to_string(entry.path().join("address")).ok())
        .find_map(|address| normalize_mac(address.trim()))
}

/// Accepts `xx:xx:xx:xx:xx:xx`, rejecting the all-zero address.
pub fn normalize_mac(text: &str) -> Option<String> {
    let octets: Vec<u8> = text
        .split(':')
        .map(|octet| u8::from_str_radix(octet, 16))
        .collect::<Result<_, _>>()
        .ok()?;
    if octets.len() != 6 || octets.iter().all(|&octet| octet == 0) {
        return None;
    }
    Some(
        octets
            .iter()
            .map(|octet| format!("{octet:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}
