//! One local SOCKS5 connection bound to a circuit stream.

use socket2::SockRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SocksError, TunnelSlot};
use crate::metrics::{self, names};
use crate::tunnel::cell::MAX_STREAM_CHUNK;
use crate::tunnel::{CircuitId, CircuitManager, StreamEvent, TunnelError};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

pub(crate) const REPLY_SUCCEEDED: u8 = 0x00;
pub(crate) const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub(crate) const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub(crate) const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub(crate) const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub(crate) const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Read the greeting and the CONNECT request. Returns the destination.
pub(crate) async fn read_request(socket: &mut TcpStream) -> Result<(String, u16), SocksError> {
    let mut head = [0u8; 2];
    socket.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::Protocol(format!("unsupported version {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    socket.read_exact(&mut methods).await?;
    if !methods.contains(&0x00) {
        socket.write_all(&[SOCKS_VERSION, 0xff]).await?;
        return Err(SocksError::Protocol("no acceptable auth method".to_string()));
    }
    socket.write_all(&[SOCKS_VERSION, 0x00]).await?;

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    if request[1] != CMD_CONNECT {
        send_reply(socket, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(request[1]));
    }

    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| SocksError::Protocol("domain is not utf-8".to_string()))?
        }
        0x04 => {
            let mut ip = [0u8; 16];
            socket.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        other => {
            send_reply(socket, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(SocksError::AddressType(other));
        }
    };

    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

/// Reply with a zero bound address
pub(crate) async fn send_reply(socket: &mut TcpStream, code: u8) -> std::io::Result<()> {
    socket
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

/// A stream on a READY circuit plus the single rebind it may still use
struct Binding {
    manager: Arc<CircuitManager>,
    tier: usize,
    host: String,
    port: u16,
    wait: Duration,
    circuit: CircuitId,
    stream_id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    rebound: bool,
}

impl Binding {
    async fn open(
        manager: Arc<CircuitManager>,
        tier: usize,
        host: String,
        port: u16,
        wait: Duration,
    ) -> Result<Self, SocksError> {
        let (circuit, stream_id, events) = open_stream(&manager, tier, &host, port, wait).await?;
        Ok(Self {
            manager,
            tier,
            host,
            port,
            wait,
            circuit,
            stream_id,
            events,
            rebound: false,
        })
    }

    /// Move the stream to another READY circuit. Allowed once.
    async fn rebind(&mut self) -> Result<(), SocksError> {
        if self.rebound {
            return Err(SocksError::Reset("circuit lost after rebind".to_string()));
        }
        self.rebound = true;

        let (circuit, stream_id, events) =
            open_stream(&self.manager, self.tier, &self.host, self.port, self.wait).await?;
        info!(
            from = self.circuit,
            to = circuit,
            tier = self.tier,
            "Rebound SOCKS connection"
        );
        metrics::record_counter(names::SOCKS_REBINDS, 1);

        self.circuit = circuit;
        self.stream_id = stream_id;
        self.events = events;
        Ok(())
    }

    fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        self.manager.send_stream_data(self.circuit, self.stream_id, data)
    }

    fn end(&self) {
        self.manager.end_stream(self.circuit, self.stream_id);
    }
}

/// Wait for a READY circuit, open a stream and wait until the exit confirms
async fn open_stream(
    manager: &CircuitManager,
    tier: usize,
    host: &str,
    port: u16,
    wait: Duration,
) -> Result<(CircuitId, u32, mpsc::UnboundedReceiver<StreamEvent>), SocksError> {
    let circuit = manager.wait_for_ready(tier, wait).await?;
    let (stream_id, mut events) = manager.open_stream(circuit, host, port)?;

    match tokio::time::timeout(wait, events.recv()).await {
        Ok(Some(StreamEvent::Opened)) => Ok((circuit, stream_id, events)),
        Ok(Some(StreamEvent::End)) => Err(SocksError::Refused(format!("{}:{}", host, port))),
        Ok(Some(StreamEvent::CircuitClosed)) | Ok(None) => Err(SocksError::Tunnel(TunnelError::Abandoned(circuit))),
        Ok(Some(StreamEvent::Data(_))) => {
            manager.end_stream(circuit, stream_id);
            Err(SocksError::Protocol("data before stream opened".to_string()))
        }
        Err(_) => {
            manager.end_stream(circuit, stream_id);
            Err(SocksError::Refused(format!("{}:{} timed out", host, port)))
        }
    }
}

/// Serve one accepted connection for `tier`
pub(crate) async fn serve(mut socket: TcpStream, tier: usize, tunnel: TunnelSlot, wait: Duration) -> Result<(), SocksError> {
    let (host, port) = read_request(&mut socket).await?;
    debug!(%host, port, tier, "SOCKS connect request");

    let Some(manager) = super::current(&tunnel) else {
        send_reply(&mut socket, REPLY_GENERAL_FAILURE).await?;
        return Err(SocksError::NoTunnel);
    };

    let mut binding = match Binding::open(manager, tier, host, port, wait).await {
        Ok(binding) => binding,
        Err(e) => {
            let code = match e {
                SocksError::Refused(_) => REPLY_CONNECTION_REFUSED,
                SocksError::Tunnel(_) => REPLY_NETWORK_UNREACHABLE,
                _ => REPLY_GENERAL_FAILURE,
            };
            send_reply(&mut socket, code).await?;
            return Err(e);
        }
    };
    send_reply(&mut socket, REPLY_SUCCEEDED).await?;

    let result = relay(&mut socket, &mut binding).await;
    if let Err(e) = &result {
        if matches!(e, SocksError::Reset(_) | SocksError::Tunnel(_) | SocksError::Refused(_)) {
            reset(&socket, e);
        }
    }
    result
}

async fn relay(socket: &mut TcpStream, binding: &mut Binding) -> Result<(), SocksError> {
    let (mut reader, mut writer) = socket.split();
    let mut buf = vec![0u8; MAX_STREAM_CHUNK];
    // Bytes the local side sent that no circuit has accepted yet
    let mut unsent: Vec<u8> = Vec::new();

    loop {
        if !unsent.is_empty() {
            match binding.send(&unsent) {
                Ok(()) => unsent.clear(),
                Err(_) => {
                    binding.rebind().await?;
                    continue;
                }
            }
        }

        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    binding.end();
                    return Ok(());
                }
                unsent.extend_from_slice(&buf[..n]);
            }
            event = binding.events.recv() => match event {
                Some(StreamEvent::Data(bytes)) => writer.write_all(&bytes).await?,
                Some(StreamEvent::End) => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
                Some(StreamEvent::Opened) => {}
                Some(StreamEvent::CircuitClosed) | None => {
                    debug!(circuit_id = binding.circuit, "Bound circuit closed");
                    binding.rebind().await?;
                }
            },
        }
    }
}

/// Abort the local connection so the engine sees a reset, not a clean close
fn reset(socket: &TcpStream, cause: &SocksError) {
    warn!(error = %cause, "Resetting SOCKS connection");
    metrics::record_counter(names::SOCKS_RESETS, 1);
    if let Err(e) = SockRef::from(socket).set_linger(Some(Duration::ZERO)) {
        debug!(error = %e, "Could not set linger for reset");
    }
}
