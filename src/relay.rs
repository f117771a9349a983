//! Bidirectional splicing between a tunnel stream and its target.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    time::Instant,
    try_join,
};

use crate::ratelimit::TokenBucket;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Remembers when bytes last moved in either direction.
struct ActivityClock {
    start: Instant,
    last_millis: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }

    /// Completes once nothing moved for `limit`.
    async fn idle(&self, limit: Duration) {
        loop {
            let idle_for = self.idle_for();
            if idle_for >= limit {
                return;
            }

            tokio::time::sleep(limit - idle_for).await;
        }
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, activity: &ActivityClock, limit: Option<&TokenBucket>) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }

        activity.touch();
        if let Some(bucket) = limit {
            bucket.consume(read).await;
        }

        writer.write_all(&buf[..read]).await?;
        writer.flush().await?;
        total += read as u64;
        activity.touch();
    }
}

/// Copies bytes both ways between `a` and `b` until both directions reach EOF. Each direction
/// shuts down its writer when its reader ends. When `idle_timeout` is set, the splice fails once
/// no bytes have moved in either direction for that long.
///
/// Returns the amount of bytes copied from `a` to `b` and from `b` to `a`.
pub async fn splice<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    splice_limited(a, b, idle_timeout, None).await
}

/// Like [`splice`], with the bytes copied from `b` to `a` paced by `limit`.
pub async fn splice_limited<A, B>(a: A, b: B, idle_timeout: Option<Duration>, limit: Option<&TokenBucket>) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let activity = ActivityClock::new();

    let copies = async {
        try_join!(
            copy_half(&mut a_read, &mut b_write, &activity, None),
            copy_half(&mut b_read, &mut a_write, &activity, limit),
        )
    };

    match idle_timeout {
        None => copies.await,
        Some(limit) => select! {
            result = copies => result,
            _ = activity.idle(limit) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("No traffic for {}s", limit.as_secs()))),
        },
    }
}
