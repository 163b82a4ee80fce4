//! High-level client for the a55d gateway
//!
//! Commands go to the command socket and wait for the gateway's reply.
//! Events go to the event socket and are not answered; the daemon queues
//! them and retries delivery on its own.

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use a55lib::{
    EventMessage, GatewayReply, LinkError, LinkResult, ParamTable, MAX_COMMAND_DATAGRAM, MAX_EVENT_DATAGRAM,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::connection::GatewayConnection;

/// Client settings; every field has a default matching the daemon's
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub command_socket: PathBuf,
    pub event_socket: PathBuf,
    /// Directory holding the temporary reply socket
    pub reply_dir: PathBuf,
    /// Longer than the daemon's acknowledgment wait so its reply is not missed
    pub reply_timeout_ms: u64,
    pub param_store_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_socket: PathBuf::from("/tmp/rpmsg_cmd.sock"),
            event_socket: PathBuf::from("/tmp/bee_to_rpmsg.sock"),
            reply_dir: env::temp_dir(),
            reply_timeout_ms: 6000,
            param_store_path: PathBuf::from("/data/.a55_src/bee_params.json"),
        }
    }
}

impl ClientConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Load client settings from a JSON file
pub fn load_client_config<P: AsRef<Path>>(path: P) -> LinkResult<ClientConfig> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// Client for the gateway sockets
pub struct GatewayClient {
    config: ClientConfig,
}

impl GatewayClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Forward one command and wait for the gateway's verdict
    pub fn send_command(&self, command: &str) -> LinkResult<GatewayReply> {
        let command = command.trim();
        if command.is_empty() {
            return Err(LinkError::protocol("empty command"));
        }
        if command.len() > MAX_COMMAND_DATAGRAM {
            return Err(LinkError::protocol(format!(
                "command is {} bytes, limit is {}",
                command.len(),
                MAX_COMMAND_DATAGRAM
            )));
        }

        let mut connection = GatewayConnection::bound(&self.config.reply_dir)?;
        connection.send_to(command.as_bytes(), &self.config.command_socket)?;
        debug!("Sent command {} to {}", command, self.config.command_socket.display());

        match connection.receive_timeout(self.config.reply_timeout())? {
            Some(text) => GatewayReply::parse(&text),
            None => Err(LinkError::Timeout),
        }
    }

    /// Hand an event to the daemon's retry queue
    pub fn send_event(&self, name: &str, value: &str) -> LinkResult<()> {
        let text = format!("EVENT {} {}", name, value);
        let event = EventMessage::parse(&text)?;
        let datagram = event.to_datagram();
        if datagram.len() > MAX_EVENT_DATAGRAM {
            return Err(LinkError::protocol(format!(
                "event is {} bytes, limit is {}",
                datagram.len(),
                MAX_EVENT_DATAGRAM
            )));
        }

        let connection = GatewayConnection::unbound()?;
        connection.send_to(datagram.as_bytes(), &self.config.event_socket)?;
        info!("Queued event {} {}", event.name, event.value);
        Ok(())
    }

    /// Read the parameter table the daemon persists
    pub fn load_params(&self) -> LinkResult<ParamTable> {
        ParamTable::load(&self.config.param_store_path)
    }
}

/// Render a parameter table, one `0xADDR value` row per entry, sorted by address
pub fn format_params(table: &ParamTable) -> String {
    let mut records = table.params.clone();
    records.sort_by_key(|r| r.addr);

    let mut out = format!("{:<12}{}\n", "ADDR", "VALUE");
    for record in &records {
        out.push_str(&format!("{:<12}{}\n", format!("{:#x}", record.addr), record.value));
    }
    out.push_str(&format!("{} parameters\n", records.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use a55lib::ParamRecord;
    use std::io::Write;
    use std::os::unix::net::UnixDatagram;
    use std::thread;
    use tempfile::{NamedTempFile, TempDir};

    fn config_in(dir: &Path) -> ClientConfig {
        ClientConfig {
            command_socket: dir.join("cmd.sock"),
            event_socket: dir.join("evt.sock"),
            reply_dir: dir.to_path_buf(),
            reply_timeout_ms: 2000,
            param_store_path: dir.join("params.json"),
        }
    }

    /// Answer one datagram with `reply`, returning what was received
    fn fake_gateway(socket: UnixDatagram, reply: &'static str) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (n, peer) = socket.recv_from(&mut buf).unwrap();
            socket.send_to(reply.as_bytes(), peer.as_pathname().unwrap()).unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        })
    }

    #[test]
    fn test_send_command_replies() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let client = GatewayClient::new(config.clone());

        let gateway = UnixDatagram::bind(&config.command_socket).unwrap();
        let handle = fake_gateway(gateway.try_clone().unwrap(), "OK");
        assert_eq!(client.send_command("led_on 1\n").unwrap(), GatewayReply::Ok);
        assert_eq!(handle.join().unwrap(), "led_on 1");

        let handle = fake_gateway(gateway, "ERROR channel failed");
        assert_eq!(
            client.send_command("led_on 1").unwrap(),
            GatewayReply::Error("channel failed".to_string())
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_send_command_no_reply_times_out() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(dir.path());
        config.reply_timeout_ms = 50;
        let _gateway = UnixDatagram::bind(&config.command_socket).unwrap();

        let client = GatewayClient::new(config);
        assert!(matches!(client.send_command("ping"), Err(LinkError::Timeout)));
    }

    #[test]
    fn test_send_command_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let client = GatewayClient::new(config_in(dir.path()));
        assert!(matches!(client.send_command("   "), Err(LinkError::Protocol(_))));
        let long = "x".repeat(MAX_COMMAND_DATAGRAM + 1);
        assert!(matches!(client.send_command(&long), Err(LinkError::Protocol(_))));
    }

    #[test]
    fn test_send_event() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let gateway = UnixDatagram::bind(&config.event_socket).unwrap();

        let client = GatewayClient::new(config);
        client.send_event("door", "open").unwrap();

        let mut buf = [0u8; 256];
        let n = gateway.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"EVENT door open");

        assert!(matches!(client.send_event("door", ""), Err(LinkError::Protocol(_))));
    }

    #[test]
    fn test_load_and_format_params() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path());
        let table = ParamTable {
            params: vec![ParamRecord::new(0x603, -2), ParamRecord::new(0x602, 1)],
        };
        std::fs::write(&config.param_store_path, serde_json::to_vec(&table).unwrap()).unwrap();

        let client = GatewayClient::new(config);
        let text = format_params(&client.load_params().unwrap());
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows[1], format!("{:<12}{}", "0x602", 1));
        assert_eq!(rows[2], format!("{:<12}{}", "0x603", -2));
        assert_eq!(rows[3], "2 parameters");
    }

    #[test]
    fn test_config_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"reply_timeout_ms": 100}}"#).unwrap();
        let config = load_client_config(file.path()).unwrap();
        assert_eq!(config.reply_timeout(), Duration::from_millis(100));
        assert_eq!(config.command_socket, PathBuf::from("/tmp/rpmsg_cmd.sock"));
    }
}
