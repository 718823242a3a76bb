//! Byte-level tunnel between a client connection and an upstream.
//!
//! Both directions run in one task; cancellation is checked between every
//! transfer, so shutdown never waits on a quiet tunnel.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{HarnessError, Result};

const COPY_BUF: usize = 4096;

/// Bytes moved by a finished tunnel, per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

struct CopyHalf {
    buf: Box<[u8; COPY_BUF]>,
    filled: usize,
    written: usize,
    needs_flush: bool,
    copied: u64,
    done: bool,
}

impl CopyHalf {
    fn new() -> Self {
        CopyHalf {
            buf: Box::new([0u8; COPY_BUF]),
            filled: 0,
            written: 0,
            needs_flush: false,
            copied: 0,
            done: false,
        }
    }

    /// Move one chunk from `reader` to `writer`. EOF half-closes the write
    /// side so the peer sees the shutdown promptly.
    ///
    /// The step is resumable: `filled`/`written`/`needs_flush` record how
    /// far the chunk got, so a step dropped by a racing `select!` arm picks
    /// up mid-chunk on the next call instead of losing bytes. Every await
    /// in here either makes no progress when cancelled (`read`, `write`) or
    /// is retried from the recorded state.
    async fn step<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.written < self.filled {
            return self.drain(writer).await;
        }
        if self.needs_flush {
            writer.flush().await?;
            self.needs_flush = false;
            return Ok(());
        }
        let n = reader.read(&mut self.buf[..]).await?;
        if n == 0 {
            writer.shutdown().await?;
            self.done = true;
            return Ok(());
        }
        self.filled = n;
        self.written = 0;
        self.copied += n as u64;
        self.drain(writer).await
    }

    async fn drain<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.filled {
            let wrote = writer.write(&self.buf[self.written..self.filled]).await?;
            if wrote == 0 {
                return Err(HarnessError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "tunnel peer stopped accepting bytes",
                )));
            }
            self.written += wrote;
        }
        self.needs_flush = true;
        writer.flush().await?;
        self.needs_flush = false;
        Ok(())
    }
}

/// Relay bytes in both directions until both sides reach EOF, the token is
/// cancelled, or either side faults.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    cancel: &CancellationToken,
) -> Result<TunnelStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut up = CopyHalf::new();
    let mut down = CopyHalf::new();

    while !(up.done && down.done) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
            res = up.step(&mut client_read, &mut upstream_write), if !up.done => res?,
            res = down.step(&mut upstream_read, &mut client_write), if !down.done => res?,
        }
    }

    let stats = TunnelStats {
        client_to_upstream: up.copied,
        upstream_to_client: down.copied,
    };
    tracing::debug!(
        up = stats.client_to_upstream,
        down = stats.upstream_to_client,
        "tunnel closed"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_both_directions_until_eof() {
        let (client_near, client_far) = duplex(1024);
        let (upstream_near, upstream_far) = duplex(1024);
        let cancel = CancellationToken::new();

        let tunnel = tokio::spawn(async move {
            relay(client_far, upstream_near, &cancel).await
        });

        let exchange = tokio::spawn(async move {
            let (mut client, mut upstream) = (client_near, upstream_far);
            client.write_all(b"ping from client").await.unwrap();
            let mut buf = [0u8; 16];
            upstream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping from client");

            upstream.write_all(b"pong").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");

            // Close both ends so the tunnel drains to EOF.
            client.shutdown().await.unwrap();
            upstream.shutdown().await.unwrap();
        });

        exchange.await.unwrap();
        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, 16);
        assert_eq!(stats.upstream_to_client, 4);
    }

    #[tokio::test]
    async fn full_duplex_load_is_lossless() {
        // Tiny pipe capacities force constant interleaving between the two
        // directions, so partially written chunks must survive the race.
        let (client_near, client_far) = duplex(4);
        let (upstream_near, upstream_far) = duplex(4);
        let cancel = CancellationToken::new();

        let tunnel = tokio::spawn(async move {
            relay(client_far, upstream_near, &cancel).await
        });

        let (mut client_read, mut client_write) = tokio::io::split(client_near);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream_far);

        let to_upstream = vec![0x5Au8; 4096];
        let to_client = vec![0xA5u8; 4096];

        let push_up = tokio::spawn(async move {
            client_write.write_all(&to_upstream).await.unwrap();
            client_write.shutdown().await.unwrap();
        });
        let push_down = tokio::spawn(async move {
            upstream_write.write_all(&to_client).await.unwrap();
            upstream_write.shutdown().await.unwrap();
        });
        let pull_up = tokio::spawn(async move {
            let mut received = Vec::new();
            upstream_read.read_to_end(&mut received).await.unwrap();
            received
        });
        let pull_down = tokio::spawn(async move {
            let mut received = Vec::new();
            client_read.read_to_end(&mut received).await.unwrap();
            received
        });

        push_up.await.unwrap();
        push_down.await.unwrap();
        assert_eq!(pull_up.await.unwrap(), vec![0x5Au8; 4096]);
        assert_eq!(pull_down.await.unwrap(), vec![0xA5u8; 4096]);

        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(stats.client_to_upstream, 4096);
        assert_eq!(stats.upstream_to_client, 4096);
    }

    #[tokio::test]
    async fn cancellation_tears_down_a_busy_tunnel() {
        let (client_near, client_far) = duplex(8);
        let (upstream_near, upstream_far) = duplex(8);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let tunnel = tokio::spawn(async move {
            relay(client_far, upstream_near, &token).await
        });

        // Keep bytes flowing in one direction while the tunnel is torn down.
        let mut client = client_near;
        let pump = tokio::spawn(async move {
            let chunk = [0x42u8; 8];
            while client.write_all(&chunk).await.is_ok() {}
        });
        let mut upstream = upstream_far;
        let drain = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            loop {
                match upstream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let err = tunnel.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // Both transports were dropped: the writer hits a broken pipe and
        // the reader sees EOF.
        pump.await.unwrap();
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_wins_over_an_idle_tunnel() {
        let (_client_near, client_far) = duplex(64);
        let (upstream_near, _upstream_far) = duplex(64);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let tunnel = tokio::spawn(async move {
            relay(client_far, upstream_near, &token).await
        });

        cancel.cancel();
        let err = tunnel.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn half_close_propagates() {
        let (client_near, client_far) = duplex(64);
        let (upstream_near, upstream_far) = duplex(64);
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            let _ = relay(client_far, upstream_near, &cancel).await;
        });

        let (mut client, mut upstream) = (client_near, upstream_far);
        client.write_all(b"bye").await.unwrap();
        client.shutdown().await.unwrap();

        let mut collected = Vec::new();
        upstream.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, b"bye");
    }
}
