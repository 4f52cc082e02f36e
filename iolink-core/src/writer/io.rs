//! Deadline-bounded socket writes.
//!
//! Every partial write re-arms against the same absolute deadline, so the
//! total time spent on one package never exceeds the write budget.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::trace;

use crate::IoError;
use crate::tls::TlsEngine;

/// Absolute deadline plus the budget it was derived from, for error reports.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteDeadline {
    pub at: Instant,
    pub budget: Duration,
}

impl WriteDeadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

pub(crate) async fn write_all_by<W>(
    socket: &mut W,
    mut buf: &[u8],
    deadline: WriteDeadline,
) -> Result<(), IoError>
where
    W: AsyncWrite + Unpin,
{
    while !buf.is_empty() {
        match timeout_at(deadline.at, socket.write(buf)).await {
            Err(_) => return Err(IoError::Timeout(deadline.budget)),
            Ok(Ok(0)) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
            Ok(Ok(n)) => {
                buf = &buf[n..];
                trace!(written = n, left = buf.len(), budget_left = ?deadline.remaining(), "partial write");
            }
            Ok(Err(e)) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                tokio::task::yield_now().await;
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(())
}

pub(crate) async fn flush_by<W>(socket: &mut W, deadline: WriteDeadline) -> Result<(), IoError>
where
    W: AsyncWrite + Unpin,
{
    match timeout_at(deadline.at, socket.flush()).await {
        Err(_) => Err(IoError::Timeout(deadline.budget)),
        Ok(res) => Ok(res?),
    }
}

/// Write whatever records the engine has pending. Returns the byte count.
pub(crate) async fn drain_engine<W>(
    socket: &mut W,
    engine: &TlsEngine,
    deadline: WriteDeadline,
) -> Result<usize, IoError>
where
    W: AsyncWrite + Unpin,
{
    let records = engine.take_outgoing()?;
    if records.is_empty() {
        return Ok(0);
    }
    write_all_by(socket, &records, deadline).await?;
    flush_by(socket, deadline).await?;
    Ok(records.len())
}
