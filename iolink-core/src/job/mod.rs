//! Send jobs: the bookkeeping that ties a submitted package to its
//! send completion and to any responses the peer sends back.

mod manager;
mod send_job;

use std::fmt;

pub use manager::{JobHandle, JobManager};
pub use send_job::{SendJob, SendOutcome};

/// Outcome delivered to send and response waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobResult {
    Success,
    Fail,
    InvalidJob,
    InvalidPackage,
    Timeout,
    /// Waiters were released early; the job itself is still live.
    UrgentlyWaked,
    /// The package is queued but not written yet.
    SendPended,
    SendQueueIsFull,
    ConnClosedByPeer,
    ConnClosedByUser,
    /// The response phase ended without a response.
    NoResponse,
}

impl JobResult {
    pub fn is_success(self) -> bool {
        self == JobResult::Success
    }

    /// Results that end a connection rather than a single job.
    pub fn is_connection_closed(self) -> bool {
        matches!(self, JobResult::ConnClosedByPeer | JobResult::ConnClosedByUser)
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobResult::Success => "success",
            JobResult::Fail => "fail",
            JobResult::InvalidJob => "invalid job",
            JobResult::InvalidPackage => "invalid package",
            JobResult::Timeout => "timeout",
            JobResult::UrgentlyWaked => "urgently waked",
            JobResult::SendPended => "send pended",
            JobResult::SendQueueIsFull => "send queue is full",
            JobResult::ConnClosedByPeer => "connection closed by peer",
            JobResult::ConnClosedByUser => "connection closed by user",
            JobResult::NoResponse => "no response",
        };
        f.write_str(s)
    }
}
