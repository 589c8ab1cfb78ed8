//! Result broadcast socket
//!
//! Clients connected to the receiver's status socket get every measurement
//! as compact JSON terminated by NUL. A client whose write fails is dropped;
//! a client that falls behind loses the records it missed.

use crate::exporter::RecordExporter;
use crate::types::ResultRecord;
use anyhow::Result;
use log::{debug, info, warn};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::{self, error::RecvError};

/// Clients served at once; further connections are closed on accept
pub const MAX_CLIENTS: usize = 4;

/// Records buffered per client
const BACKLOG: usize = 1024;

/// Publishes measurement records to status socket clients
#[derive(Clone)]
pub struct StatusPublisher {
    tx: broadcast::Sender<Arc<str>>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BACKLOG);
        Self { tx }
    }

    /// Number of connected clients
    pub fn clients(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordExporter for StatusPublisher {
    fn export(&mut self, record: &ResultRecord) -> Result<()> {
        let is_measurement = matches!(record, ResultRecord::RxPacket(_) | ResultRecord::RxFinal(_));
        if !is_measurement || self.clients() == 0 {
            return Ok(());
        }

        let json = serde_json::to_string(record)?;
        // Fails only when the last client left since the check above
        let _ = self.tx.send(Arc::from(json));
        Ok(())
    }
}

/// Bind the status socket, replacing a stale one
pub fn bind(path: &Path) -> Result<UnixListener> {
    crate::control::bind_listener(path, "status")
}

/// Accept clients until the task is dropped
pub async fn serve(listener: UnixListener, publisher: StatusPublisher) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                if publisher.clients() >= MAX_CLIENTS {
                    warn!("Status socket full ({} clients), refusing connection", MAX_CLIENTS);
                    continue;
                }
                info!("Status client connected");
                tokio::spawn(feed_client(stream, publisher.tx.subscribe()));
            }
            Err(e) => {
                warn!("Status socket accept failed: {}", e);
                return;
            }
        }
    }
}

async fn feed_client(mut stream: UnixStream, mut records: broadcast::Receiver<Arc<str>>) {
    loop {
        let json = match records.recv().await {
            Ok(json) => json,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Status client fell behind, {} records skipped", skipped);
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        if let Err(e) = write_record(&mut stream, &json).await {
            debug!("Dropping status client: {}", e);
            return;
        }
    }
}

async fn write_record(stream: &mut UnixStream, json: &str) -> io::Result<()> {
    stream.write_all(json.as_bytes()).await?;
    stream.write_all(b"\0").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwts::RxTimestamps;
    use crate::types::{Measurement, SequenceError};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use txrx_common::{EtherHeader, TestFrame};

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("txrx-status-{}-{}.socket", name, std::process::id()))
    }

    fn measurement(seq: u32) -> ResultRecord {
        let mut frame = TestFrame::new(EtherHeader::default());
        frame.sequence = seq;
        ResultRecord::RxPacket(Measurement::new(&frame, None, &RxTimestamps::default()))
    }

    async fn wait_for_clients(publisher: &StatusPublisher, expected: usize) {
        for _ in 0..100 {
            if publisher.clients() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publisher.clients(), expected);
    }

    #[test]
    fn test_export_without_clients() {
        let mut publisher = StatusPublisher::new();
        publisher.export(&measurement(0)).unwrap();
        assert_eq!(publisher.clients(), 0);
    }

    #[tokio::test]
    async fn test_client_receives_measurements_only() {
        let path = socket_path("feed");
        let listener = bind(&path).unwrap();
        let mut publisher = StatusPublisher::new();
        let server = tokio::spawn(serve(listener, publisher.clone()));

        let client = UnixStream::connect(&path).await.unwrap();
        wait_for_clients(&publisher, 1).await;

        publisher
            .export(&ResultRecord::RxError(SequenceError {
                stream_id: 0,
                sequence_number: 5,
                dropped_packets: 2,
                sequence_error: false,
            }))
            .unwrap();
        publisher.export(&measurement(7)).unwrap();

        let mut reader = BufReader::new(client);
        let mut message = Vec::new();
        reader.read_until(b'\0', &mut message).await.unwrap();
        assert_eq!(message.pop(), Some(b'\0'));

        let value: serde_json::Value = serde_json::from_slice(&message).unwrap();
        assert_eq!(value["type"], "rx-packet");
        assert_eq!(value["object"]["sequence-number"], 7);

        server.abort();
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_closed_client_is_dropped() {
        let path = socket_path("drop");
        let listener = bind(&path).unwrap();
        let mut publisher = StatusPublisher::new();
        let server = tokio::spawn(serve(listener, publisher.clone()));

        let client = UnixStream::connect(&path).await.unwrap();
        wait_for_clients(&publisher, 1).await;
        drop(client);

        for seq in 0..100 {
            if publisher.clients() == 0 {
                break;
            }
            publisher.export(&measurement(seq)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publisher.clients(), 0);

        server.abort();
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_connections_beyond_limit_are_closed() {
        let path = socket_path("limit");
        let listener = bind(&path).unwrap();
        let publisher = StatusPublisher::new();
        let server = tokio::spawn(serve(listener, publisher.clone()));

        let mut clients = Vec::new();
        for _ in 0..MAX_CLIENTS {
            clients.push(UnixStream::connect(&path).await.unwrap());
        }
        wait_for_clients(&publisher, MAX_CLIENTS).await;

        let mut extra = UnixStream::connect(&path).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(1), extra.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(publisher.clients(), MAX_CLIENTS);

        server.abort();
        std::fs::remove_file(path).ok();
    }
}
