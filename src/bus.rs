//! Inter-process message bus
//!
//! The processes talk over line-oriented JSON TCP sockets: the web process
//! pushes `{action, data?}` messages into the master inbox, and master/web
//! tee their log lines to the log process. Sends are fire-and-forget; a
//! dead peer never blocks the sender.

use std::io::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriter;

use crate::worker::MasterSignals;

/// One message on the master inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Strip the optional scheme prefix from a bus address.
pub fn socket_addr(url: &str) -> &str {
    url.trim_start_matches("tcp://")
}

/// Accept inbox connections and dispatch messages to the worker forever.
pub async fn serve_inbox(bind_addr: &str, signals: Arc<dyn MasterSignals>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Master inbox listening on {}", bind_addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let signals = signals.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<BusMessage>(&line) {
                    Ok(message) => dispatch(signals.as_ref(), message),
                    Err(e) => warn!("Invalid bus message from {}: {}", peer, e),
                }
            }
        });
    }
}

fn dispatch(signals: &dyn MasterSignals, message: BusMessage) {
    match message.action.as_str() {
        "schedule" => signals.schedule(),
        "container_callback" => signals.container_callback(),
        "data_container_callback" => signals.data_container_callback(),
        "update_node_status" => {
            let node_name = message
                .data
                .as_ref()
                .and_then(|data| data.get("node_name"))
                .and_then(Value::as_str);
            match node_name {
                Some(node_name) => signals.update_node_status(node_name),
                None => warn!("update_node_status without node_name"),
            }
        }
        other => warn!("Unknown bus action: {}", other),
    }
}

/// Client side of the master inbox, used by the web process.
pub struct BusClient {
    addr: String,
}

impl BusClient {
    pub fn new(master_url: &str) -> Self {
        Self {
            addr: socket_addr(master_url).to_string(),
        }
    }

    fn send(&self, action: &str, data: Option<Value>) {
        let addr = self.addr.clone();
        let message = BusMessage {
            action: action.to_string(),
            data,
        };
        tokio::spawn(async move {
            let Ok(payload) = serde_json::to_string(&message) else {
                return;
            };
            match TcpStream::connect(&addr).await {
                Ok(mut stream) => {
                    let line = format!("{}\n", payload);
                    if let Err(e) = stream.write_all(line.as_bytes()).await {
                        warn!("Bus send to {} failed: {}", addr, e);
                    }
                }
                Err(e) => warn!("Bus connect to {} failed: {}", addr, e),
            }
        });
    }
}

impl MasterSignals for BusClient {
    fn schedule(&self) {
        self.send("schedule", None);
    }

    fn container_callback(&self) {
        self.send("container_callback", None);
    }

    fn data_container_callback(&self) {
        self.send("data_container_callback", None);
    }

    fn update_node_status(&self, node_name: &str) {
        self.send(
            "update_node_status",
            Some(serde_json::json!({ "node_name": node_name })),
        );
    }
}

/// Tees formatted tracing output to stdout and the log process.
///
/// The forwarding thread owns the socket and reconnects lazily; lines are
/// dropped when the log process is unreachable.
pub struct LogForwarder {
    sender: std::sync::mpsc::Sender<Vec<u8>>,
}

impl LogForwarder {
    pub fn connect(log_url: &str) -> Self {
        let addr = socket_addr(log_url).to_string();
        let (sender, receiver) = std::sync::mpsc::channel::<Vec<u8>>();

        std::thread::spawn(move || {
            let mut stream: Option<std::net::TcpStream> = None;
            while let Ok(line) = receiver.recv() {
                if stream.is_none() {
                    stream = std::net::TcpStream::connect(&addr).ok();
                }
                if let Some(s) = stream.as_mut() {
                    if s.write_all(&line).is_err() {
                        stream = None;
                    }
                }
            }
        });

        Self { sender }
    }
}

impl<'a> MakeWriter<'a> for LogForwarder {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            sender: self.sender.clone(),
        }
    }
}

pub struct TeeWriter {
    sender: std::sync::mpsc::Sender<Vec<u8>>,
}

impl std::io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = std::io::stdout().write(buf)?;
        let _ = self.sender.send(buf.to_vec());
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}
