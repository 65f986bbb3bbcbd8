//! # 双向字节泵
//!
//! CONNECT 隧道和普通转发的响应回传共用：两个方向各一个拷贝循环，
//! 任一方向读到 EOF 就半关闭对端的写方向；两个方向都结束、空闲超时或强制关闭时返回。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// 泵结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// 两个方向都正常结束
    Completed,
    /// 空闲超时
    IdleTimeout,
    /// 关闭宽限期结束后被强制中止
    Cancelled,
}

/// 泵的统计结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// 客户端 -> 上游字节数
    pub client_to_upstream: u64,
    /// 上游 -> 客户端字节数
    pub upstream_to_client: u64,
    /// 结束原因
    pub outcome: PumpOutcome,
}

/// 最近一次有字节流动的时间
#[derive(Debug)]
struct Activity {
    start: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_millis.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

async fn copy_direction<R, W>(mut reader: R, mut writer: W, activity: Arc<Activity>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        activity.touch();
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    total
}

/// 在两个流之间双向拷贝字节，不解释内容
pub async fn pump<C, U>(client: C, upstream: U, idle_timeout: Duration, cancel: CancellationToken) -> PumpStats
where
    C: AsyncRead + AsyncWrite + Send,
    U: AsyncRead + AsyncWrite + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let activity = Arc::new(Activity::new());

    let client_to_upstream = copy_direction(client_read, upstream_write, Arc::clone(&activity));
    let upstream_to_client = copy_direction(upstream_read, client_write, Arc::clone(&activity));
    tokio::pin!(client_to_upstream);
    tokio::pin!(upstream_to_client);

    let check_every = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut ticker = tokio::time::interval(check_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut up_bytes = None;
    let mut down_bytes = None;
    let outcome = loop {
        if up_bytes.is_some() && down_bytes.is_some() {
            break PumpOutcome::Completed;
        }
        tokio::select! {
            n = &mut client_to_upstream, if up_bytes.is_none() => up_bytes = Some(n),
            n = &mut upstream_to_client, if down_bytes.is_none() => down_bytes = Some(n),
            _ = ticker.tick() => {
                if activity.idle_for() >= idle_timeout {
                    break PumpOutcome::IdleTimeout;
                }
            }
            () = cancel.cancelled() => break PumpOutcome::Cancelled,
        }
    };

    PumpStats {
        client_to_upstream: up_bytes.unwrap_or_default(),
        upstream_to_client: down_bytes.unwrap_or_default(),
        outcome,
    }
}

/// 单向拷贝直到读端 EOF；两次读之间超过 `idle_timeout` 或被取消时提前结束
pub async fn relay_until_eof<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> (u64, PumpOutcome)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            read = tokio::time::timeout(idle_timeout, reader.read(&mut buf)) => read,
            () = cancel.cancelled() => return (total, PumpOutcome::Cancelled),
        };
        let n = match read {
            Err(_) => return (total, PumpOutcome::IdleTimeout),
            Ok(Ok(0) | Err(_)) => break,
            Ok(Ok(n)) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() || writer.flush().await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    (total, PumpOutcome::Completed)
}
