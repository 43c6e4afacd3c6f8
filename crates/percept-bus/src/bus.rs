//! The frame bus: broadcast lanes plus per-lane demand tracking.

use percept_types::{ImageFrame, PerceptError};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::warn;

/// Default channel capacity.  Image pipelines only care about the newest
/// frame, so the buffer holds exactly one message and a slow subscriber
/// lags past anything older.
const DEFAULT_CAPACITY: usize = 1;

/// The two image lanes routed over the bus.
///
/// The processing-latency metric travels on its own dedicated lane (see
/// [`FrameBus::publish_process_time`]) because it carries a scalar, not an
/// [`ImageFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Unprocessed frames straight from the camera driver.
    RawImage,
    /// Lens-distortion-corrected frames.
    RectifiedImage,
}

/// A single broadcast lane with an attached subscriber-count watch.
struct Lane<T> {
    sender: broadcast::Sender<T>,
    demand: Arc<watch::Sender<usize>>,
}

impl<T> Clone for Lane<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            demand: self.demand.clone(),
        }
    }
}

impl<T: Clone> Lane<T> {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let (demand, _) = watch::channel(0);
        Self {
            sender,
            demand: Arc::new(demand),
        }
    }

    /// Hand the value to every live subscriber.  Zero subscribers is the
    /// normal idle condition for a sensor lane, not an error.
    fn publish(&self, value: T) -> Result<usize, PerceptError> {
        match self.sender.send(value) {
            Ok(n) => Ok(n),
            Err(broadcast::error::SendError(_)) => Ok(0),
        }
    }

    fn subscribe(&self) -> (broadcast::Receiver<T>, DemandGuard) {
        let receiver = self.sender.subscribe();
        self.demand.send_modify(|count| *count += 1);
        (
            receiver,
            DemandGuard {
                demand: self.demand.clone(),
            },
        )
    }

    fn subscriber_count(&self) -> usize {
        *self.demand.borrow()
    }
}

/// RAII handle held inside every receiver.  Dropping it decrements the
/// lane's subscriber count and wakes all demand watchers.
struct DemandGuard {
    demand: Arc<watch::Sender<usize>>,
}

impl Drop for DemandGuard {
    fn drop(&mut self) {
        self.demand.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Shared frame bus.  Clone it cheaply – all clones share the same
/// underlying channels and demand counters.
#[derive(Clone)]
pub struct FrameBus {
    raw: Lane<ImageFrame>,
    rectified: Lane<ImageFrame>,
    process_time: Lane<f32>,
}

impl FrameBus {
    /// Create a new bus with the given per-lane channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            raw: Lane::new(capacity),
            rectified: Lane::new(capacity),
            process_time: Lane::new(capacity),
        }
    }

    /// Publish a frame to the given image [`Topic`].
    ///
    /// Returns the number of active receivers that were handed the frame.
    /// `Ok(0)` means nobody is currently listening, which is a normal
    /// condition for a sensor lane.
    pub fn publish_frame(&self, topic: Topic, frame: ImageFrame) -> Result<usize, PerceptError> {
        self.frame_lane(topic).publish(frame)
    }

    /// Publish a processing-latency sample (seconds) to the metric lane.
    pub fn publish_process_time(&self, seconds: f32) -> Result<usize, PerceptError> {
        self.process_time.publish(seconds)
    }

    /// Subscribe to an image [`Topic`].
    ///
    /// The lane's subscriber count is incremented immediately and
    /// decremented when the returned [`FrameReceiver`] is dropped; both
    /// transitions are visible through [`FrameBus::demand_watch`].
    pub fn subscribe_frames(&self, topic: Topic) -> FrameReceiver {
        let (receiver, _guard) = self.frame_lane(topic).subscribe();
        FrameReceiver {
            topic,
            receiver,
            _guard,
        }
    }

    /// Subscribe to the processing-latency metric lane.
    pub fn subscribe_process_time(&self) -> ProcessTimeReceiver {
        let (receiver, _guard) = self.process_time.subscribe();
        ProcessTimeReceiver { receiver, _guard }
    }

    /// Current number of live subscribers on an image lane.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.frame_lane(topic).subscriber_count()
    }

    /// Watch an image lane's subscriber count.
    ///
    /// The returned receiver yields a change notification exactly when the
    /// count changes (subscribe or receiver drop), carrying the new value.
    pub fn demand_watch(&self, topic: Topic) -> watch::Receiver<usize> {
        self.frame_lane(topic).demand.subscribe()
    }

    fn frame_lane(&self, topic: Topic) -> &Lane<ImageFrame> {
        match topic {
            Topic::RawImage => &self.raw,
            Topic::RectifiedImage => &self.rectified,
        }
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Receivers
// ───────────────────────────────────────────────────────────────────────────

/// An async receiver bound to a single image [`Topic`].
///
/// Obtained via [`FrameBus::subscribe_frames`].  Holding one counts as
/// demand on the lane; dropping it releases that demand.
pub struct FrameReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<ImageFrame>,
    _guard: DemandGuard,
}

impl FrameReceiver {
    /// Wait for the next frame on this lane.
    ///
    /// Returns:
    /// * `Ok(frame)` – a successfully received frame.
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   frames were dropped.  With the default depth-1 lanes this simply
    ///   means older frames were superseded; call `recv` again for the
    ///   newest one.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<ImageFrame, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Like [`recv`][Self::recv], but silently skips over lag: always
    /// resolves to the newest available frame or `None` once the bus is
    /// closed.
    pub async fn recv_latest(&mut self) -> Option<ImageFrame> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, skipped = n, "frame receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// An async receiver for processing-latency samples.
pub struct ProcessTimeReceiver {
    receiver: broadcast::Receiver<f32>,
    _guard: DemandGuard,
}

impl ProcessTimeReceiver {
    /// Wait for the next latency sample (seconds).
    pub async fn recv(&mut self) -> Result<f32, broadcast::error::RecvError> {
        self.receiver.recv().await
    }
}
