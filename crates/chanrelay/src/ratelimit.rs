use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Which budget a rejected publish would have exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limited {
    /// Too many messages in the window.
    Messages,
    /// Too many bytes in the window.
    Bytes,
}

impl Limited {
    /// Metric label for the drop reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "msg_rate",
            Self::Bytes => "bw_rate",
        }
    }
}

/// Sliding one-minute window over a session's publishes.
///
/// The window never holds more than `msg_rate` entries because anything past
/// that is rejected before it is recorded.
#[derive(Debug)]
pub struct PublishLimiter {
    msg_rate: u32,
    bw_rate: u64,
    window: VecDeque<(Instant, u64)>,
    bytes: u64,
}

impl PublishLimiter {
    /// Allow `msg_rate` messages and `bw_rate` bytes per minute.
    #[must_use]
    pub fn new(msg_rate: u32, bw_rate: u64) -> Self {
        Self {
            msg_rate,
            bw_rate,
            window: VecDeque::with_capacity(64),
            bytes: 0,
        }
    }

    /// Record a publish of `len` bytes if it fits both budgets.
    pub fn check(&mut self, len: usize) -> Result<(), Limited> {
        self.check_at(len, Instant::now())
    }

    fn check_at(&mut self, len: usize, now: Instant) -> Result<(), Limited> {
        while let Some(&(at, bytes)) = self.window.front() {
            if now.saturating_duration_since(at) < WINDOW {
                break;
            }
            self.bytes = self.bytes.saturating_sub(bytes);
            self.window.pop_front();
        }

        if self.window.len() >= self.msg_rate as usize {
            return Err(Limited::Messages);
        }
        let len = len as u64;
        if self.bytes.saturating_add(len) > self.bw_rate {
            return Err(Limited::Bytes);
        }

        self.window.push_back((now, len));
        self.bytes = self.bytes.saturating_add(len);
        Ok(())
    }
}
