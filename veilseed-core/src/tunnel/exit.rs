//! TCP streams opened on behalf of circuits that end at this node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::cell::{RelayMessage, MAX_STREAM_CHUNK};

/// Previous hop address and circuit id on that link
pub type LinkKey = (SocketAddr, u32);

type StreamKey = (SocketAddr, u32, u32);

/// A message the exit sends back toward the circuit's client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReply {
    pub link: LinkKey,
    pub message: RelayMessage,
}

struct ExitStream {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

type StreamMap = Arc<Mutex<HashMap<StreamKey, ExitStream>>>;

fn locked(streams: &StreamMap) -> std::sync::MutexGuard<'_, HashMap<StreamKey, ExitStream>> {
    streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ExitService {
    enabled: bool,
    open_timeout: Duration,
    replies: mpsc::UnboundedSender<ExitReply>,
    streams: StreamMap,
}

impl ExitService {
    pub fn new(enabled: bool, open_timeout: Duration, replies: mpsc::UnboundedSender<ExitReply>) -> Self {
        Self {
            enabled,
            open_timeout,
            replies,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stream_count(&self) -> usize {
        locked(&self.streams).len()
    }

    fn reply(&self, link: LinkKey, message: RelayMessage) {
        let _ = self.replies.send(ExitReply { link, message });
    }

    /// Handle a stream message delivered to this node as the last hop
    pub fn handle(&self, link: LinkKey, message: RelayMessage) {
        match message {
            RelayMessage::Open { stream_id, host, port } => self.open(link, stream_id, host, port),
            RelayMessage::Data { stream_id, bytes } => {
                let streams = locked(&self.streams);
                match streams.get(&(link.0, link.1, stream_id)) {
                    Some(stream) => {
                        let _ = stream.writer.send(bytes);
                    }
                    None => debug!(stream_id, "Data for unknown exit stream"),
                }
            }
            RelayMessage::End { stream_id } => {
                if let Some(stream) = locked(&self.streams).remove(&(link.0, link.1, stream_id)) {
                    stream.task.abort();
                    debug!(stream_id, "Exit stream ended by client");
                }
            }
            other => debug!(message = ?other, "Ignoring non-stream message at exit"),
        }
    }

    fn open(&self, link: LinkKey, stream_id: u32, host: String, port: u16) {
        if !self.enabled {
            debug!(stream_id, "Exit disabled, refusing stream");
            self.reply(link, RelayMessage::End { stream_id });
            return;
        }

        let key = (link.0, link.1, stream_id);
        let (writer, outgoing) = mpsc::unbounded_channel();
        let replies = self.replies.clone();
        let streams = Arc::clone(&self.streams);
        let open_timeout = self.open_timeout;

        let mut map = locked(&self.streams);
        if map.contains_key(&key) {
            debug!(stream_id, "Duplicate exit stream id");
            return;
        }

        let task = tokio::spawn(async move {
            let connected = tokio::time::timeout(open_timeout, TcpStream::connect((host.as_str(), port))).await;
            match connected {
                Ok(Ok(socket)) => {
                    info!(stream_id, %host, port, "Exit stream connected");
                    let _ = replies.send(ExitReply {
                        link,
                        message: RelayMessage::Opened { stream_id },
                    });
                    pump(socket, link, stream_id, outgoing, &replies).await;
                }
                Ok(Err(e)) => debug!(stream_id, %host, port, error = %e, "Exit connect failed"),
                Err(_) => debug!(stream_id, %host, port, "Exit connect timed out"),
            }

            if locked(&streams).remove(&key).is_some() {
                let _ = replies.send(ExitReply {
                    link,
                    message: RelayMessage::End { stream_id },
                });
            }
        });

        map.insert(key, ExitStream { writer, task });
    }

    /// Drop every stream of a circuit that went away
    pub fn close_link(&self, link: LinkKey) {
        let mut streams = locked(&self.streams);
        let keys: Vec<StreamKey> = streams
            .keys()
            .filter(|(addr, cid, _)| (*addr, *cid) == link)
            .copied()
            .collect();
        for key in keys {
            if let Some(stream) = streams.remove(&key) {
                stream.task.abort();
            }
        }
    }

    pub fn shutdown(&self) {
        for (_, stream) in locked(&self.streams).drain() {
            stream.task.abort();
        }
    }
}

async fn pump(
    socket: TcpStream,
    link: LinkKey,
    stream_id: u32,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    replies: &mpsc::UnboundedSender<ExitReply>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let mut buf = vec![0u8; MAX_STREAM_CHUNK];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let message = RelayMessage::Data { stream_id, bytes: buf[..n].to_vec() };
                    if replies.send(ExitReply { link, message }).is_err() {
                        break;
                    }
                }
            },
            data = outgoing.recv() => match data {
                Some(data) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = writer.shutdown().await;
}
