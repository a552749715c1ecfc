//! The per-transfer protocol engines: RRQ send and WRQ receive. Each
//! engine drives its ephemeral socket through a `tokio::time::timeout`
//! retry loop, resending the last outstanding DATA or ACK on a
//! transient timeout up to a fixed retry budget.

use crate::buffer_pool::BufferPool;
use crate::connlog::{LogEntry, Operation};
use crate::error::{Result, TftpError};
use crate::store::{Blob, BlobStore};
use crate::{ErrorCode, Packet, BLOCK_SIZE, MAX_RETRIES, READ_TIMEOUT};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// The initial request datagram plus the endpoints it establishes,
/// consumed by exactly one of [`send_rrq`]/[`receive_wrq`].
#[derive(Debug, Clone)]
pub struct Handshake {
    pub client: SocketAddr,
    pub filename: String,
}

/// Outcome of a completed transfer, folded into the caller's [`LogEntry`].
pub struct Outcome {
    pub bytes: usize,
}

/// Send `handshake.filename`'s blob to the client as ordered DATA
/// blocks, one at a time, each awaiting its matching ACK.
pub async fn send_rrq<S: BlobStore>(
    handshake: &Handshake,
    store: &S,
    pool: &BufferPool,
    log: &mut LogEntry,
) -> Result<Outcome> {
    let socket = connect_ephemeral(handshake.client).await?;

    let blob = match store.get(&handshake.filename).await {
        Ok(blob) => blob,
        Err(e) => {
            send_error(&socket, e.wire_code(), &e.to_string()).await;
            return Err(e);
        }
    };

    let chunks: Vec<&[u8]> = blob.data.chunks(BLOCK_SIZE).collect();
    let needs_empty_tail = !blob.data.is_empty() && blob.data.len() % BLOCK_SIZE == 0;
    let total_blocks = chunks.len().max(1) + usize::from(needs_empty_tail);

    let mut buf = pool.acquire().await;
    buf.resize(crate::MAX_PACKET_SIZE, 0);
    for seq in 0..total_blocks {
        let block = (seq + 1) as u16;
        let payload: &[u8] = chunks.get(seq).copied().unwrap_or(&[]);
        let packet = Packet::Data {
            block,
            payload: payload.to_vec(),
        };

        if let Err(e) = send_with_retry(&socket, &packet, block, &mut buf, handshake).await {
            send_error(&socket, e.wire_code(), &e.to_string()).await;
            pool.release(buf).await;
            return Err(e);
        }
    }
    pool.release(buf).await;

    log.finish_ok(blob.data.len());
    Ok(Outcome {
        bytes: blob.data.len(),
    })
}

/// Send `packet` (a DATA block) and wait for its matching ACK, retrying on
/// a transient timeout up to [`MAX_RETRIES`] times. On each retry the same
/// DATA block is resent, since (unlike the WRQ side) there is no previous
/// ACK to resend while waiting for the very first acknowledgement.
async fn send_with_retry(
    socket: &UdpSocket,
    packet: &Packet,
    expected_block: u16,
    buf: &mut [u8],
    handshake: &Handshake,
) -> Result<()> {
    let wire = packet.to_bytes();
    for attempt in 0..=MAX_RETRIES {
        socket.send(&wire).await?;

        match tokio::time::timeout(READ_TIMEOUT, socket.recv(buf)).await {
            Ok(Ok(n)) => match Packet::parse(&buf[..n]) {
                Ok(Packet::Ack { block }) if block == expected_block => return Ok(()),
                Ok(Packet::Error { code, message }) => {
                    return Err(TftpError::protocol(
                        code,
                        format!("client reported error: {message}"),
                    ));
                }
                Ok(_) | Err(_) => {
                    return Err(TftpError::protocol(
                        ErrorCode::Unknown,
                        "expected an ACK for the sent block",
                    ));
                }
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) if attempt < MAX_RETRIES => {
                tracing::warn!(
                    client = %handshake.client,
                    block = expected_block,
                    attempt,
                    "timed out waiting for ACK, resending"
                );
                continue;
            }
            Err(_elapsed) => {
                return Err(TftpError::protocol(
                    ErrorCode::Unknown,
                    format!("no ACK for block {expected_block} after {MAX_RETRIES} retries"),
                ));
            }
        }
    }
    unreachable!("loop always returns")
}

/// Accept an ordered DATA stream from the client, acknowledging each
/// block, and commit the assembled payload to the store.
pub async fn receive_wrq<S: BlobStore>(
    handshake: &Handshake,
    store: &S,
    pool: &BufferPool,
    log: &mut LogEntry,
) -> Result<Outcome> {
    let socket = connect_ephemeral(handshake.client).await?;

    send_ack(&socket, 0).await?;

    let mut accumulator = Vec::new();
    let mut expected: u16 = 1;
    let mut buf = pool.acquire().await;
    buf.resize(crate::MAX_PACKET_SIZE, 0);

    loop {
        match read_data_with_retry(&socket, &mut buf, expected, handshake).await {
            Ok(payload) => {
                let len = payload.len();
                accumulator.extend_from_slice(&payload);
                send_ack(&socket, expected).await?;
                if len < BLOCK_SIZE {
                    break;
                }
                expected = expected.wrapping_add(1);
            }
            Err(e) => {
                send_error(&socket, e.wire_code(), &e.to_string()).await;
                pool.release(buf).await;
                return Err(e);
            }
        }
    }
    pool.release(buf).await;

    let bytes = accumulator.len();
    store
        .put(Blob {
            name: handshake.filename.clone(),
            data: accumulator,
        })
        .await?;

    log.finish_ok(bytes);
    Ok(Outcome { bytes })
}

/// Read one DATA block for `expected`, honoring the retry policy
/// On a transient timeout, resend `ACK{expected-1}` (the last
/// successfully acknowledged block) and retry up to [`MAX_RETRIES`]
/// times. A repeated `DATA{expected-1}` is a benign duplicate, not a
/// protocol error: re-ACK it and keep waiting for `expected` (the
/// duplicate-retransmission case the original engine leaves unhandled).
async fn read_data_with_retry(
    socket: &UdpSocket,
    buf: &mut [u8],
    expected: u16,
    handshake: &Handshake,
) -> Result<Vec<u8>> {
    let last_acked = expected.wrapping_sub(1);
    for attempt in 0..=MAX_RETRIES {
        match tokio::time::timeout(READ_TIMEOUT, socket.recv_from(buf)).await {
            Ok(Ok((n, peer))) => {
                if peer.port() != handshake.client.port() {
                    return Err(TftpError::protocol(
                        ErrorCode::BadId,
                        format!("datagram from unexpected peer {peer}"),
                    ));
                }
                match Packet::parse(&buf[..n]) {
                    Ok(Packet::Data { block, payload }) if block == expected => {
                        return Ok(payload)
                    }
                    Ok(Packet::Data { block, .. }) if block == last_acked => {
                        send_ack(socket, last_acked).await?;
                        continue;
                    }
                    Ok(Packet::Data { block, .. }) => {
                        return Err(TftpError::protocol(
                            ErrorCode::Unknown,
                            format!("wrong block num, got {block}, want {expected}"),
                        ));
                    }
                    Ok(Packet::Error { code, message }) => {
                        return Err(TftpError::protocol(
                            code,
                            format!("client reported error: {message}"),
                        ));
                    }
                    Ok(_) => {
                        return Err(TftpError::protocol(
                            ErrorCode::Unknown,
                            "expected a DATA packet",
                        ));
                    }
                    Err(parse_err) => {
                        return Err(TftpError::protocol(ErrorCode::Unknown, parse_err.to_string()))
                    }
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) if attempt < MAX_RETRIES => {
                tracing::warn!(
                    client = %handshake.client,
                    block = expected,
                    attempt,
                    "timed out waiting for DATA, resending last ACK"
                );
                send_ack(socket, last_acked).await?;
                continue;
            }
            Err(_elapsed) => {
                return Err(TftpError::protocol(
                    ErrorCode::Unknown,
                    format!("no DATA for block {expected} after {MAX_RETRIES} retries"),
                ));
            }
        }
    }
    unreachable!("loop always returns")
}

async fn connect_ephemeral(peer: SocketAddr) -> Result<UdpSocket> {
    let bind_addr: SocketAddr = if peer.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(peer).await?;
    Ok(socket)
}

async fn send_ack(socket: &UdpSocket, block: u16) -> Result<()> {
    socket.send(&Packet::Ack { block }.to_bytes()).await?;
    Ok(())
}

async fn send_error(socket: &UdpSocket, code: ErrorCode, message: &str) {
    let packet = Packet::Error {
        code,
        message: message.to_string(),
    };
    if let Err(e) = socket.send(&packet.to_bytes()).await {
        tracing::warn!(error = %e, "failed to send ERROR packet to client");
    }
}

pub fn log_op(op: &Packet) -> Operation {
    match op {
        Packet::Request {
            kind: crate::RequestKind::Rrq,
            ..
        } => Operation::Get,
        Packet::Request {
            kind: crate::RequestKind::Wrq,
            ..
        } => Operation::Put,
        _ => Operation::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connlog::{LogEntry, Operation};
    use crate::store::MemoryStore;
    use tokio::net::UdpSocket;

    async fn client_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    /// A 1024-byte blob (exact multiple of 512) yields a trailing
    /// empty DATA block.
    #[tokio::test]
    async fn rrq_empty_block_rule() {
        let store = MemoryStore::new();
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        store
            .put(Blob {
                name: "a.bin".into(),
                data: data.clone(),
            })
            .await
            .unwrap();

        let client = client_socket().await;
        let client_addr = client.local_addr().unwrap();
        let pool = BufferPool::new_default();

        let handshake = Handshake {
            client: client_addr,
            filename: "a.bin".into(),
        };
        let mut log = LogEntry::new(Operation::Get, client_addr, "a.bin".into());

        let server_task = tokio::spawn(async move {
            send_rrq(&handshake, &store, &pool, &mut log).await.unwrap();
            log
        });

        let mut received = Vec::new();
        let mut buf = vec![0u8; 2048];
        let mut server_addr = None;
        loop {
            let (n, from) = client.recv_from(&mut buf).await.unwrap();
            server_addr = Some(from);
            match Packet::parse(&buf[..n]).unwrap() {
                Packet::Data { block, payload } => {
                    let done = payload.len() < BLOCK_SIZE;
                    received.extend_from_slice(&payload);
                    client
                        .send_to(&Packet::Ack { block }.to_bytes(), from)
                        .await
                        .unwrap();
                    if done {
                        break;
                    }
                }
                other => panic!("unexpected packet {other:?}"),
            }
        }
        assert!(server_addr.is_some());
        assert_eq!(received, data);

        let log = server_task.await.unwrap();
        assert_eq!(log.bytes, 1024);
        assert!(log.error.is_none());
    }

    /// RRQ of a missing blob yields ERROR{NOT_FOUND}.
    #[tokio::test]
    async fn rrq_not_found() {
        let store = MemoryStore::new();
        let client = client_socket().await;
        let client_addr = client.local_addr().unwrap();
        let pool = BufferPool::new_default();
        let handshake = Handshake {
            client: client_addr,
            filename: "x".into(),
        };
        let mut log = LogEntry::new(Operation::Get, client_addr, "x".into());

        let server_task =
            tokio::spawn(async move { send_rrq(&handshake, &store, &pool, &mut log).await });

        let mut buf = vec![0u8; 2048];
        let (n, _from) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..n]).unwrap() {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
            other => panic!("unexpected packet {other:?}"),
        }

        assert!(server_task.await.unwrap().is_err());
    }

    /// WRQ of 612 bytes across two DATA blocks, second one short.
    #[tokio::test]
    async fn wrq_assembles_blob() {
        let store_handle = std::sync::Arc::new(MemoryStore::new());
        let store_for_task = store_handle.clone();
        let client = client_socket().await;
        let client_addr = client.local_addr().unwrap();
        let pool = BufferPool::new_default();
        let handshake = Handshake {
            client: client_addr,
            filename: "t.zip".into(),
        };
        let mut log = LogEntry::new(Operation::Put, client_addr, "t.zip".into());

        let server_task = tokio::spawn(async move {
            receive_wrq(&handshake, store_for_task.as_ref(), &pool, &mut log)
                .await
                .unwrap();
            log
        });

        let mut buf = vec![0u8; 2048];
        let (n, server_addr) = client.recv_from(&mut buf).await.unwrap();
        match Packet::parse(&buf[..n]).unwrap() {
            Packet::Ack { block: 0 } => {}
            other => panic!("expected ACK{{0}}, got {other:?}"),
        }

        let first = vec![7u8; 512];
        client
            .send_to(&Packet::Data { block: 1, payload: first.clone() }.to_bytes(), server_addr)
            .await
            .unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::parse(&buf[..n]).unwrap(), Packet::Ack { block: 1 });

        let second = vec![9u8; 100];
        client
            .send_to(&Packet::Data { block: 2, payload: second.clone() }.to_bytes(), server_addr)
            .await
            .unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::parse(&buf[..n]).unwrap(), Packet::Ack { block: 2 });

        let log = server_task.await.unwrap();
        assert_eq!(log.bytes, 612);

        let stored = store_handle.get("t.zip").await.unwrap();
        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(stored.data, expected);
    }

    /// A duplicate DATA{b-1} during a WRQ gets ACK{b-1} resent
    /// and the engine keeps waiting for block b, rather than erroring.
    #[tokio::test]
    async fn duplicate_retransmission_is_benign() {
        let store = MemoryStore::new();
        let client = client_socket().await;
        let client_addr = client.local_addr().unwrap();
        let pool = BufferPool::new_default();
        let handshake = Handshake {
            client: client_addr,
            filename: "d.bin".into(),
        };
        let mut log = LogEntry::new(Operation::Put, client_addr, "d.bin".into());

        let server_task = tokio::spawn(async move {
            receive_wrq(&handshake, &store, &pool, &mut log).await.unwrap();
            log
        });

        let mut buf = vec![0u8; 2048];
        let (_, server_addr) = client.recv_from(&mut buf).await.unwrap(); // ACK{0}

        // A full (non-terminal) first block.
        let payload = vec![1u8; BLOCK_SIZE];
        client
            .send_to(&Packet::Data { block: 1, payload: payload.clone() }.to_bytes(), server_addr)
            .await
            .unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::parse(&buf[..n]).unwrap(), Packet::Ack { block: 1 });

        // Resend block 1 again (duplicate) before sending the real final
        // block 2; server must re-ACK block 1 without erroring.
        client
            .send_to(&Packet::Data { block: 1, payload: payload.clone() }.to_bytes(), server_addr)
            .await
            .unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::parse(&buf[..n]).unwrap(), Packet::Ack { block: 1 });

        client
            .send_to(&Packet::Data { block: 2, payload: vec![9u8; 3] }.to_bytes(), server_addr)
            .await
            .unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::parse(&buf[..n]).unwrap(), Packet::Ack { block: 2 });

        let log = server_task.await.unwrap();
        assert_eq!(log.bytes, BLOCK_SIZE + 3);
    }
}
