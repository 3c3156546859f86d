//! Accelerated overlay endpoint.
//!
//! Packet I/O runs on dedicated OS threads. Outgoing datagrams are sharded
//! over `worker_threads` send workers by destination address, so everything
//! addressed to one peer (and therefore every cell of one circuit direction)
//! leaves through the same worker in send order. A single receive thread
//! polls the socket with a short read timeout and hands datagrams back to
//! the runtime over an unbounded queue.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use super::{EndpointError, EndpointKind, OverlayEndpoint, MAX_DATAGRAM_SIZE};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

type Datagram = (SocketAddr, Vec<u8>);

struct Running {
    local: SocketAddr,
    senders: Vec<std_mpsc::Sender<Datagram>>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

pub struct AcceleratedEndpoint {
    bind: SocketAddr,
    worker_threads: usize,
    running: Mutex<Option<Running>>,
    inbound: AsyncMutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
}

impl AcceleratedEndpoint {
    pub fn new(bind: SocketAddr, worker_threads: usize) -> Self {
        Self {
            bind,
            worker_threads: worker_threads.max(1),
            running: Mutex::new(None),
            inbound: AsyncMutex::new(None),
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    fn shard(&self, addr: &SocketAddr) -> usize {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        (hasher.finish() % self.worker_threads as u64) as usize
    }

    fn bind_error(&self, e: std::io::Error) -> EndpointError {
        EndpointError::Bind {
            addr: self.bind,
            reason: e.to_string(),
        }
    }
}

fn send_worker(index: usize, socket: UdpSocket, queue: std_mpsc::Receiver<Datagram>) {
    // Exits when the endpoint drops its senders
    while let Ok((addr, data)) = queue.recv() {
        if let Err(e) = socket.send_to(&data, addr) {
            warn!(worker = index, %addr, error = %e, "Accelerated send failed");
        }
    }
    debug!(worker = index, "Send worker stopped");
}

fn recv_worker(socket: UdpSocket, stop: Arc<AtomicBool>, out: mpsc::UnboundedSender<Datagram>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while !stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if out.send((from, buf[..len].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                warn!(error = %e, "Accelerated receive failed");
            }
        }
    }
    debug!("Receive worker stopped");
}

#[async_trait]
impl OverlayEndpoint for AcceleratedEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Accelerated
    }

    async fn open(&self) -> Result<SocketAddr, EndpointError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let socket = UdpSocket::bind(self.bind).map_err(|e| self.bind_error(e))?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| self.bind_error(e))?;
        let local = socket.local_addr().map_err(|e| self.bind_error(e))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(self.worker_threads);
        let mut threads = Vec::with_capacity(self.worker_threads + 1);

        for index in 0..self.worker_threads {
            let (tx, rx) = std_mpsc::channel();
            let worker_socket = socket.try_clone().map_err(|e| self.bind_error(e))?;
            let handle = thread::Builder::new()
                .name(format!("veilseed-send-{}", index))
                .spawn(move || send_worker(index, worker_socket, rx))
                .map_err(|e| self.bind_error(e))?;
            senders.push(tx);
            threads.push(handle);
        }

        let recv_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("veilseed-recv".to_string())
            .spawn(move || recv_worker(socket, recv_stop, inbound_tx))
            .map_err(|e| self.bind_error(e))?;
        threads.push(handle);

        *self.inbound.lock().await = Some(inbound_rx);
        *self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Running {
            local,
            senders,
            stop,
            threads,
        });

        debug!(%local, workers = self.worker_threads, "Accelerated endpoint open");
        Ok(local)
    }

    async fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), EndpointError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(EndpointError::TooLarge(data.len()));
        }

        let shard = self.shard(&addr);
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let running = running.as_ref().ok_or(EndpointError::NotOpen)?;

        running.senders[shard]
            .send((addr, data.to_vec()))
            .map_err(|_| EndpointError::Send {
                addr,
                reason: "send worker stopped".to_string(),
            })
    }

    async fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), EndpointError> {
        let mut inbound = self.inbound.lock().await;
        let rx = inbound.as_mut().ok_or(EndpointError::Closed)?;
        rx.recv().await.ok_or(EndpointError::Closed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|running| running.local)
    }

    fn is_open(&self) -> bool {
        self.local_addr().is_some()
    }

    async fn close(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let Some(running) = running else {
            return;
        };

        running.stop.store(true, Ordering::Release);
        drop(running.senders);

        let threads = running.threads;
        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads {
                let _ = handle.join();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "Failed to join accelerated endpoint threads");
        }

        debug!(local = %running.local, "Accelerated endpoint closed");
    }
}
