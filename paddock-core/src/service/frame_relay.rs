//! Bounded per-camera frame relay.
//!
//! Each horse with an authenticated camera uplink owns a fixed-capacity ring
//! buffer of recent JPEG frames plus a single-slot latest-frame cache.
//! Viewers pull frames through [`FrameRelay::serve`], a poll-driven stream:
//! a slow consumer suspends the loop at the yield point, so memory use stays
//! bounded no matter how far the viewer falls behind.
//!
//! State is process-local and dies with the process; running multiple server
//! instances requires sticky routing of camera uplinks and viewers to the
//! same instance.

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::HorseId;
use crate::{Error, Result};

/// JPEG start-of-image marker; anything else is not a frame.
const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Ring fill ratio above which delivery speeds up.
const DRAIN_PRESSURE_RATIO: f32 = 0.8;
/// Ring fill ratio below which delivery slows down.
const STARVED_RATIO: f32 = 0.2;

struct SubjectBuffer {
    ring: Mutex<VecDeque<Bytes>>,
    latest: Mutex<Option<Bytes>>,
}

impl SubjectBuffer {
    fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::new()),
            latest: Mutex::new(None),
        }
    }
}

/// Shared relay between camera uplinks and viewer streams.
pub struct FrameRelay {
    buffers: DashMap<HorseId, Arc<SubjectBuffer>>,
    capacity: usize,
    target_interval: Duration,
    placeholder: Option<Bytes>,
}

impl FrameRelay {
    #[must_use]
    pub fn new(capacity: usize, target_interval: Duration, placeholder: Option<Bytes>) -> Self {
        Self {
            buffers: DashMap::new(),
            capacity,
            target_interval,
            placeholder,
        }
    }

    /// Create the subject's buffers. Called when a camera uplink
    /// authenticates; replaces any leftover state from a previous uplink.
    pub fn register(&self, subject: &HorseId) {
        info!(horse_id = %subject, "frame relay subject registered");
        self.buffers
            .insert(subject.clone(), Arc::new(SubjectBuffer::new()));
    }

    /// Release the subject's buffers. Called when the camera uplink
    /// disconnects; open viewer loops fall back to the placeholder.
    pub fn teardown(&self, subject: &HorseId) {
        if self.buffers.remove(subject).is_some() {
            info!(horse_id = %subject, "frame relay subject torn down");
        }
    }

    /// Number of subjects with a live uplink.
    #[must_use]
    pub fn active_subjects(&self) -> usize {
        self.buffers.len()
    }

    /// Ingest one camera frame.
    ///
    /// Rejects payloads that do not start with the JPEG start-of-image
    /// marker. Overflow evicts the oldest unread frame.
    pub fn ingest_frame(&self, subject: &HorseId, bytes: Bytes) -> Result<()> {
        if !bytes.starts_with(&JPEG_SOI) {
            return Err(Error::Validation("Frame is not a JPEG image".to_string()));
        }

        let Some(buffer) = self.buffers.get(subject) else {
            // Uplink torn down while a frame was in flight.
            debug!(horse_id = %subject, "frame dropped, no registered uplink");
            return Ok(());
        };

        {
            let mut ring = buffer.ring.lock();
            ring.push_back(bytes.clone());
            if ring.len() > self.capacity {
                ring.pop_front();
            }
        }
        *buffer.latest.lock() = Some(bytes);

        Ok(())
    }

    /// Pull the next frame for a viewer plus the current ring fill ratio.
    ///
    /// Ring front first (FIFO preserves temporal order), then the latest
    /// frame cache, then the placeholder.
    fn next_frame(&self, subject: &HorseId) -> (Option<Bytes>, f32) {
        let Some(buffer) = self.buffers.get(subject) else {
            return (self.placeholder.clone(), 0.0);
        };

        let (from_ring, fill) = {
            let mut ring = buffer.ring.lock();
            #[allow(clippy::cast_precision_loss)]
            let fill = ring.len() as f32 / self.capacity as f32;
            (ring.pop_front(), fill)
        };

        let frame = from_ring
            .or_else(|| buffer.latest.lock().clone())
            .or_else(|| self.placeholder.clone());
        (frame, fill)
    }

    /// Advisory delay before the next delivery for the observed fill ratio.
    fn pacing_interval(&self, fill: f32) -> Duration {
        if fill > DRAIN_PRESSURE_RATIO {
            self.target_interval / 2
        } else if fill < STARVED_RATIO {
            self.target_interval * 2
        } else {
            self.target_interval
        }
    }

    /// Serve a viewer: an infinite, non-restartable sequence of frame bytes.
    ///
    /// The stream lives until the consumer drops it (connection close); it
    /// survives uplink teardown by falling back to the placeholder. Ticks
    /// with nothing to send yield no item rather than blocking.
    pub fn serve(self: Arc<Self>, subject: HorseId) -> impl Stream<Item = Bytes> + Send {
        async_stream::stream! {
            let mut delivered: u64 = 0;
            loop {
                let (frame, fill) = self.next_frame(&subject);
                let interval = self.pacing_interval(fill);

                if let Some(frame) = frame {
                    delivered += 1;
                    if delivered % 300 == 0 {
                        debug!(horse_id = %subject, delivered, "viewer stream progress");
                    }
                    yield frame;
                }

                tokio::time::sleep(interval).await;
            }
        }
    }
}

impl std::fmt::Debug for FrameRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRelay")
            .field("capacity", &self.capacity)
            .field("subjects", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg_frame(tag: u8) -> Bytes {
        Bytes::from(vec![0xFF, 0xD8, 0xFF, 0xE0, tag])
    }

    fn relay(capacity: usize) -> Arc<FrameRelay> {
        Arc::new(FrameRelay::new(
            capacity,
            Duration::from_millis(33),
            Some(Bytes::from_static(b"\xFF\xD8\xFFplaceholder")),
        ))
    }

    #[test]
    fn test_rejects_non_jpeg_payload() {
        let relay = relay(4);
        let subject = HorseId::new();
        relay.register(&subject);

        let err = relay
            .ingest_frame(&subject, Bytes::from_static(b"PNG-not-jpeg"))
            .expect_err("must reject");
        assert!(matches!(err, Error::Validation(_)));

        // Buffer state unchanged
        let (frame, fill) = relay.next_frame(&subject);
        assert_eq!(fill, 0.0);
        // Nothing ingested, so the placeholder is served
        assert_eq!(frame, Some(Bytes::from_static(b"\xFF\xD8\xFFplaceholder")));
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let capacity = 4;
        let relay = relay(capacity);
        let subject = HorseId::new();
        relay.register(&subject);

        for tag in 0..=capacity as u8 {
            relay
                .ingest_frame(&subject, jpeg_frame(tag))
                .expect("ingest");
        }

        // C+1 frames in, the oldest (tag 0) was evicted; the C most recent
        // remain in order.
        for expected in 1..=capacity as u8 {
            let (frame, _) = relay.next_frame(&subject);
            assert_eq!(frame, Some(jpeg_frame(expected)));
        }
    }

    #[test]
    fn test_falls_back_to_latest_then_placeholder() {
        let relay = relay(4);
        let subject = HorseId::new();
        relay.register(&subject);

        relay.ingest_frame(&subject, jpeg_frame(7)).expect("ingest");

        // First pull drains the ring
        let (frame, _) = relay.next_frame(&subject);
        assert_eq!(frame, Some(jpeg_frame(7)));

        // Ring empty: the latest-frame cache still serves the same frame
        let (frame, _) = relay.next_frame(&subject);
        assert_eq!(frame, Some(jpeg_frame(7)));

        // After teardown only the placeholder remains
        relay.teardown(&subject);
        let (frame, _) = relay.next_frame(&subject);
        assert_eq!(frame, Some(Bytes::from_static(b"\xFF\xD8\xFFplaceholder")));
    }

    #[test]
    fn test_ingest_without_registration_is_dropped() {
        let relay = relay(4);
        let subject = HorseId::new();

        // No registered uplink: the frame is dropped without error
        relay.ingest_frame(&subject, jpeg_frame(1)).expect("ok");
        assert_eq!(relay.active_subjects(), 0);
    }

    #[test]
    fn test_register_replaces_previous_state() {
        let relay = relay(4);
        let subject = HorseId::new();
        relay.register(&subject);
        relay.ingest_frame(&subject, jpeg_frame(1)).expect("ingest");

        // A reconnecting uplink starts from an empty buffer
        relay.register(&subject);
        let (frame, fill) = relay.next_frame(&subject);
        assert_eq!(fill, 0.0);
        assert_eq!(frame, Some(Bytes::from_static(b"\xFF\xD8\xFFplaceholder")));
    }

    #[test]
    fn test_pacing_adapts_to_fill() {
        let relay = relay(10);
        let target = Duration::from_millis(33);
        assert_eq!(relay.pacing_interval(0.9), target / 2);
        assert_eq!(relay.pacing_interval(0.5), target);
        assert_eq!(relay.pacing_interval(0.05), target * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_yields_frames_in_order() {
        use futures::StreamExt;

        let relay = relay(4);
        let subject = HorseId::new();
        relay.register(&subject);
        relay.ingest_frame(&subject, jpeg_frame(1)).expect("ingest");
        relay.ingest_frame(&subject, jpeg_frame(2)).expect("ingest");

        let mut stream = Box::pin(relay.clone().serve(subject));
        assert_eq!(stream.next().await, Some(jpeg_frame(1)));
        assert_eq!(stream.next().await, Some(jpeg_frame(2)));
    }
}
