//! Metered bidirectional splice between a user-entry socket and its twin

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use burrow_control::FlowCounters;

pub(crate) type SocketHalves = (OwnedReadHalf, OwnedWriteHalf);

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Pipe both directions until they finish, counting bytes per direction.
///
/// `entry` is the side where the user entered (server listener for forward
/// modes, data connection for reverse modes); `exit` is the service side.
/// The pre-buffers are flushed first, in order: `entry_pre` into `exit`
/// (SOCKS5 preData), `exit_pre` into `entry` (data-connection residual).
/// Each direction propagates its FIN or error by shutting down the peer's
/// write half, so half-close and abort cascade.
pub(crate) async fn pipe_pair(
    entry: SocketHalves,
    exit: SocketHalves,
    entry_pre: Bytes,
    exit_pre: Bytes,
    counters: Arc<FlowCounters>,
) -> (u64, u64) {
    let (entry_read, entry_write) = entry;
    let (exit_read, exit_write) = exit;

    let in_counters = counters.clone();
    let inbound = copy_direction(entry_read, exit_write, entry_pre, move |n| {
        in_counters.add_in(n)
    });
    let outbound = copy_direction(exit_read, entry_write, exit_pre, move |n| {
        counters.add_out(n)
    });

    tokio::join!(inbound, outbound)
}

async fn copy_direction(
    mut read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    pre: Bytes,
    count: impl Fn(u64),
) -> u64 {
    let mut total = 0u64;

    if !pre.is_empty() {
        if write.write_all(&pre).await.is_err() {
            let _ = write.shutdown().await;
            return total;
        }
        count(pre.len() as u64);
        total += pre.len() as u64;
    }

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                count(n as u64);
                total += n as u64;
            }
            Err(_) => break,
        }
    }

    let _ = write.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_pipe_moves_bytes_and_counts_them() {
        let (user, user_peer) = socket_pair().await;
        let (data, data_peer) = socket_pair().await;
        let counters = Arc::new(FlowCounters::default());

        let pipe = tokio::spawn(pipe_pair(
            user.into_split(),
            data.into_split(),
            Bytes::new(),
            Bytes::new(),
            counters.clone(),
        ));

        let (mut user_peer_read, mut user_peer_write) = user_peer.into_split();
        let (mut data_peer_read, mut data_peer_write) = data_peer.into_split();

        user_peer_write.write_all(b"HELLO\n").await.unwrap();
        let mut buf = [0u8; 6];
        data_peer_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO\n");

        data_peer_write.write_all(b"WORLD").await.unwrap();
        let mut buf = [0u8; 5];
        user_peer_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"WORLD");

        // User FIN propagates to the exit side, and the pipe finishes.
        user_peer_write.shutdown().await.unwrap();
        data_peer_write.shutdown().await.unwrap();
        let (bytes_in, bytes_out) = pipe.await.unwrap();

        assert_eq!(bytes_in, 6);
        assert_eq!(bytes_out, 5);
        assert_eq!(counters.bytes_in.load(std::sync::atomic::Ordering::Relaxed), 6);
        assert_eq!(counters.bytes_out.load(std::sync::atomic::Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_pre_buffers_flushed_first_in_order() {
        let (user, user_peer) = socket_pair().await;
        let (data, data_peer) = socket_pair().await;
        let counters = Arc::new(FlowCounters::default());

        let pipe = tokio::spawn(pipe_pair(
            user.into_split(),
            data.into_split(),
            Bytes::from_static(b"pre-to-exit|"),
            Bytes::from_static(b"pre-to-entry|"),
            counters,
        ));

        let (mut user_peer_read, mut user_peer_write) = user_peer.into_split();
        let (mut data_peer_read, mut data_peer_write) = data_peer.into_split();

        user_peer_write.write_all(b"live").await.unwrap();
        user_peer_write.shutdown().await.unwrap();
        data_peer_write.shutdown().await.unwrap();

        let mut to_exit = Vec::new();
        data_peer_read.read_to_end(&mut to_exit).await.unwrap();
        assert_eq!(&to_exit, b"pre-to-exit|live");

        let mut to_entry = Vec::new();
        user_peer_read.read_to_end(&mut to_entry).await.unwrap();
        assert_eq!(&to_entry, b"pre-to-entry|");

        let (bytes_in, bytes_out) = pipe.await.unwrap();
        assert_eq!(bytes_in, 16);
        assert_eq!(bytes_out, 13);
    }
}
