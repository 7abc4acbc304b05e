//! Inbound mixing queue
//!
//! Every frame read off a peer stream is held for a delay drawn uniformly
//! from `[0, mixing_delay_max]` before dispatch. Two frames arriving close
//! together can be released in reverse order; that decorrelation of
//! arrival and departure timing is the point.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use veilnet_core::Frame;

/// A frame released by the mixer
#[derive(Debug)]
pub struct MixedFrame {
    pub peer_id: u64,
    pub frame: Frame,
}

#[derive(Clone)]
pub struct Mixer {
    delay_max: Duration,
    out: mpsc::UnboundedSender<MixedFrame>,
}

impl Mixer {
    /// Create a mixer and the receiver its frames are released on
    pub fn new(delay_max: Duration) -> (Self, mpsc::UnboundedReceiver<MixedFrame>) {
        let (out, rx) = mpsc::unbounded_channel();
        (Self { delay_max, out }, rx)
    }

    /// Schedule a frame for randomized release
    pub fn enqueue(&self, peer_id: u64, frame: Frame) {
        let delay = self.random_delay();
        let out = self.out.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = out.send(MixedFrame { peer_id, frame });
        });
    }

    fn random_delay(&self) -> Duration {
        let max = self.delay_max.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}
