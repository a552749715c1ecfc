//! Listener & dispatcher: the single-socket accept loop, the
//! `Idle -> Listening -> Draining -> Stopped` state machine, and the
//! shared shutdown/in-flight-counter state. Dispatch routes WRQ to the
//! write engine, RRQ to the read engine, and anything else to a spawned
//! task that replies `ERROR{BAD_OP}` without blocking the accept loop.
//! The shutdown flag is `Arc<RwLock<bool>>` rather than a
//! `tokio::sync::watch` channel, polled on each loop iteration alongside
//! a short receive timeout.

use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::connlog::{ConnectionLog, LogEntry, Operation};
use crate::store::BlobStore;
use crate::transfer::{receive_wrq, send_rrq, Handshake};
use crate::{ErrorCode, Packet, RequestKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

/// The listener's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Listening,
    Draining,
    Stopped,
}

/// The listener and dispatcher. Generic over the blob store backend so an
/// embedder can plug in a different `BlobStore` without touching this
/// module; `MemoryStore` is the only backend this crate ships.
pub struct Server<S: BlobStore + 'static> {
    config: ServerConfig,
    store: Arc<S>,
    log: ConnectionLog,
    pool: BufferPool,
    shutdown: Arc<RwLock<bool>>,
    in_flight: Arc<AtomicUsize>,
    state: RwLock<State>,
}

impl<S: BlobStore + 'static> Server<S> {
    pub fn new(config: ServerConfig, store: S) -> Self {
        let log = ConnectionLog::spawn(config.logfile.clone());
        Self {
            config,
            store: Arc::new(store),
            log,
            pool: BufferPool::new_default(),
            shutdown: Arc::new(RwLock::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            state: RwLock::new(State::Idle),
        }
    }

    /// Request a graceful shutdown. Idempotent: calling it again once
    /// draining or stopped has no further effect.
    pub async fn stop(&self) {
        let mut flag = self.shutdown.write().await;
        *flag = true;
    }

    pub async fn state(&self) -> State {
        *self.state.read().await
    }

    /// Bind the main listener and run the accept loop until shutdown is
    /// requested and every in-flight transfer has finished.
    pub async fn run(&self) -> crate::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.config.listen_addr()).await?);
        tracing::info!(addr = %self.config.listen_addr(), "tftp server listening");
        *self.state.write().await = State::Listening;

        let mut buf = vec![0u8; crate::MAX_PACKET_SIZE];
        loop {
            if *self.shutdown.read().await {
                break;
            }

            let recv = tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf))
                .await;
            let (n, peer) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => continue,
            };

            match Packet::parse(&buf[..n]) {
                Ok(Packet::Request { kind, filename, .. }) => {
                    self.spawn_transfer(kind, filename, peer);
                }
                Ok(_) | Err(_) => {
                    self.spawn_bad_op(peer);
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    fn spawn_transfer(&self, kind: RequestKind, filename: String, peer: std::net::SocketAddr) {
        let store = self.store.clone();
        let pool = self.pool.clone();
        let log = self.log.clone();
        let in_flight = self.in_flight.clone();

        let op = match kind {
            RequestKind::Rrq => Operation::Get,
            RequestKind::Wrq => Operation::Put,
        };
        let mut entry = LogEntry::new(op, peer, filename.clone());
        let handshake = Handshake {
            client: peer,
            filename,
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let result = match kind {
                RequestKind::Rrq => send_rrq(&handshake, store.as_ref(), &pool, &mut entry).await,
                RequestKind::Wrq => {
                    receive_wrq(&handshake, store.as_ref(), &pool, &mut entry).await
                }
            };
            entry.duration = start.elapsed();
            if let Err(e) = result {
                entry.finish_err(&e);
            }
            log.record(entry).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Non-RRQ/WRQ opcode on the main listener: reply
    /// with `ERROR{BAD_OP}` from a throwaway ephemeral socket without
    /// blocking the accept loop.
    fn spawn_bad_op(&self, peer: std::net::SocketAddr) {
        tokio::spawn(async move {
            if let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await {
                if socket.connect(peer).await.is_ok() {
                    let packet = Packet::Error {
                        code: ErrorCode::BadOp,
                        message: "expected RRQ or WRQ".into(),
                    };
                    let _ = socket.send(&packet.to_bytes()).await;
                }
            }
        });
    }

    /// `Draining`: wait for in-flight transfers to finish, then invalidate
    /// the store and transition to `Stopped`.
    async fn drain(&self) {
        *self.state.write().await = State::Draining;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.store.terminate().await;
        *self.state.write().await = State::Stopped;
        tracing::info!("tftp server drained and stopped");
    }
}
