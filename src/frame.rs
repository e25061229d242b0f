use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;

/// One video frame handed to the detector backends.
///
/// Data is tightly packed RGB24. A frame with zero dimensions models a
/// source that is running but not yet decodable (camera warming up); the
/// sampling loop skips those without counting a cycle.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Unique frame identifier
    pub id: u64,
    /// Media timestamp in milliseconds since the source started
    pub timestamp_ms: u64,
    /// Wall-clock capture time
    pub captured_at: SystemTime,
    /// Raw RGB24 data (shared ownership for efficiency)
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl VideoFrame {
    pub fn new(id: u64, timestamp_ms: u64, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            id,
            timestamp_ms,
            captured_at: SystemTime::now(),
            data: Arc::new(data),
            width,
            height,
        }
    }

    /// Expected byte length for tightly packed RGB24.
    pub fn expected_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// A frame is decodable once it has real dimensions and a full buffer.
    pub fn is_decodable(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_size()
    }
}

/// Where the sampling loop pulls frames from.
///
/// `grab` returns the newest frame available right now, or None when nothing
/// is ready; it never blocks waiting for the camera.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn grab(&self) -> Option<VideoFrame>;
}

/// Single-slot latest-frame exchange between a producer and the sampling
/// loop.
///
/// The loop only ever wants the newest frame, so the slot replaces rather
/// than queues; a slow consumer sees frames drop, never a backlog.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Mutex<Option<VideoFrame>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot with a newer frame.
    pub fn push(&self, frame: VideoFrame) {
        *self.slot.lock() = Some(frame);
    }

    /// Snapshot of the newest frame, if any.
    pub fn latest(&self) -> Option<VideoFrame> {
        self.slot.lock().clone()
    }

    /// Drop whatever is buffered.
    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

#[async_trait]
impl FrameSource for FrameBuffer {
    async fn grab(&self) -> Option<VideoFrame> {
        self.latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(id: u64, width: u32, height: u32) -> VideoFrame {
        VideoFrame::new(id, id * 33, vec![0u8; (width * height * 3) as usize], width, height)
    }

    #[test]
    fn test_decodable_frame() {
        let frame = rgb_frame(1, 64, 48);
        assert_eq!(frame.expected_size(), 64 * 48 * 3);
        assert!(frame.is_decodable());
    }

    #[test]
    fn test_zero_dimension_frame_is_not_decodable() {
        let frame = VideoFrame::new(1, 0, Vec::new(), 0, 0);
        assert!(!frame.is_decodable());
    }

    #[test]
    fn test_truncated_frame_is_not_decodable() {
        let frame = VideoFrame::new(2, 33, vec![0u8; 10], 64, 48);
        assert!(!frame.is_decodable());
    }

    #[tokio::test]
    async fn test_frame_buffer_keeps_newest() {
        let buffer = FrameBuffer::new();
        assert!(buffer.grab().await.is_none());

        buffer.push(rgb_frame(1, 8, 8));
        buffer.push(rgb_frame(2, 8, 8));

        let got = buffer.grab().await.unwrap();
        assert_eq!(got.id, 2);

        buffer.clear();
        assert!(buffer.grab().await.is_none());
    }
}
