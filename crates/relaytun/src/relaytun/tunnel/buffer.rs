use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;

use crate::relaytun::tunnel::protocol::MAX_DATA_PAYLOAD;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("ack {ack} exceeds bytes sent {sent}")]
    BeyondSent { ack: u64, sent: u64 },
    #[error("ack {ack} regresses below {acked}")]
    Regressed { ack: u64, acked: u64 },
}

/// Retains every byte handed to the relay until the peer acknowledges it.
///
/// Offsets are absolute stream positions within one relay session.
#[derive(Debug)]
pub struct SequencedSendBuffer {
    segments: VecDeque<Bytes>,
    sent_total: u64,
    acked: u64,
    retained: usize,
    high_water: usize,
}

impl SequencedSendBuffer {
    pub fn new(high_water: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            sent_total: 0,
            acked: 0,
            retained: 0,
            high_water: high_water.max(MAX_DATA_PAYLOAD),
        }
    }

    pub fn append(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.sent_total += data.len() as u64;
        self.retained += data.len();
        self.segments.push_back(data);
    }

    /// Applies a cumulative ack. Repeating the current ack is a no-op.
    pub fn on_ack(&mut self, ack: u64) -> Result<(), AckError> {
        if ack > self.sent_total {
            return Err(AckError::BeyondSent {
                ack,
                sent: self.sent_total,
            });
        }
        if ack < self.acked {
            return Err(AckError::Regressed {
                ack,
                acked: self.acked,
            });
        }

        let mut release = (ack - self.acked) as usize;
        while release > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= release {
                release -= front.len();
                self.retained -= front.len();
                self.segments.pop_front();
            } else {
                let _ = front.split_to(release);
                self.retained -= release;
                release = 0;
            }
        }
        self.acked = ack;
        Ok(())
    }

    /// Returns the unacknowledged bytes from `ack` onward, in order, in chunks that fit
    /// a single data frame. Also applies `ack`.
    pub fn replay_from(&mut self, ack: u64) -> Result<Vec<Bytes>, AckError> {
        self.on_ack(ack)?;
        let mut out = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            let mut seg = seg.clone();
            while !seg.is_empty() {
                let n = seg.len().min(MAX_DATA_PAYLOAD);
                out.push(seg.split_to(n));
            }
        }
        Ok(out)
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn unacked(&self) -> u64 {
        self.sent_total - self.acked
    }

    pub fn retained(&self) -> usize {
        self.retained
    }

    /// Callers stop feeding data while the buffer is at or above its high-water mark.
    pub fn is_full(&self) -> bool {
        self.retained >= self.high_water
    }
}
