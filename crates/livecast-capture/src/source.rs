//! Media sources the recorder can consume.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::CaptureError;
use crate::segment::CapturedSegment;
use crate::{CaptureResult, SEGMENT_CHANNEL_CAPACITY};

/// Container/codec identifiers in order of preference.
pub const PREFERRED_MIME_TYPES: &[&str] = &[
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=vp8,opus",
    "video/webm",
    "video/mp4",
];

/// Messages emitted by a running source.
#[derive(Debug, Clone)]
pub enum SourceMessage {
    /// An encoded chunk of media.
    Segment(CapturedSegment),

    /// The source hit an unrecoverable error and will emit nothing more.
    Failed(String),
}

/// A local stream that can be encoded into segments.
///
/// Sources borrow tracks owned elsewhere; stopping a source must not stop
/// the underlying tracks.
pub trait MediaSource: Send {
    /// Whether the source can produce the given container/codec.
    fn supports(&self, mime_type: &str) -> bool;

    /// Start emitting segments encoded as `mime_type`.
    fn start(&mut self, mime_type: &str) -> CaptureResult<Receiver<SourceMessage>>;

    /// Stop emitting. Any final segment must be sent before returning.
    fn stop(&mut self) -> CaptureResult<()>;

    /// Check if the source is emitting.
    fn is_active(&self) -> bool;
}

/// Pick the first preferred mime type the source supports.
pub fn negotiate_mime_type(source: &dyn MediaSource) -> CaptureResult<&'static str> {
    PREFERRED_MIME_TYPES
        .iter()
        .copied()
        .find(|mime| source.supports(mime))
        .ok_or_else(|| CaptureError::Unsupported(PREFERRED_MIME_TYPES.join(", ")))
}

/// Producer half of a [`ChannelSource`].
#[derive(Clone)]
pub struct SourceFeed {
    sender: Sender<SourceMessage>,
    sequence: Arc<AtomicU64>,
}

impl SourceFeed {
    /// Emit one segment.
    pub fn push(&self, data: impl Into<Bytes>) -> CaptureResult<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let segment =
            CapturedSegment::new(data.into(), sequence);
        self.sender
            .send(SourceMessage::Segment(segment))
            .map_err(|_| CaptureError::ChannelDisconnected)
    }

    /// Report an unrecoverable error.
    pub fn fail(&self, reason: impl Into<String>) -> CaptureResult<()> {
        self.sender
            .send(SourceMessage::Failed(reason.into()))
            .map_err(|_| CaptureError::ChannelDisconnected)
    }
}

/// A source fed externally through a [`SourceFeed`].
pub struct ChannelSource {
    supported: Vec<String>,
    receiver: Option<Receiver<SourceMessage>>,
    is_active: bool,
}

impl ChannelSource {
    /// Create a source that supports the given mime types.
    pub fn new(supported: &[&str]) -> (Self, SourceFeed) {
        let (sender, receiver) = crossbeam_channel::bounded(SEGMENT_CHANNEL_CAPACITY);
        let source = Self {
            supported: supported.iter().map(|s| s.to_string()).collect(),
            receiver: Some(receiver),
            is_active: false,
        };
        let feed = SourceFeed {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        };
        (source, feed)
    }
}

impl MediaSource for ChannelSource {
    fn supports(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|s| s == mime_type)
    }

    fn start(&mut self, _mime_type: &str) -> CaptureResult<Receiver<SourceMessage>> {
        let receiver = self.receiver.take().ok_or(CaptureError::AlreadyFinished)?;
        self.is_active = true;
        Ok(receiver)
    }

    fn stop(&mut self) -> CaptureResult<()> {
        self.is_active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.is_active
    }
}

/// A source that emits fixed-size segments on a timer thread.
pub struct SyntheticSource {
    segment_bytes: usize,
    interval: Duration,
    should_stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticSource {
    pub fn new(segment_bytes: usize, interval: Duration) -> Self {
        Self {
            segment_bytes,
            interval,
            should_stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }
}

impl MediaSource for SyntheticSource {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type.starts_with("video/webm")
    }

    fn start(&mut self, mime_type: &str) -> CaptureResult<Receiver<SourceMessage>> {
        if self.is_active() {
            return Err(CaptureError::AlreadyFinished);
        }

        debug!(mime_type, "Starting synthetic source");
        let (sender, receiver) = crossbeam_channel::bounded(SEGMENT_CHANNEL_CAPACITY);
        let should_stop = Arc::clone(&self.should_stop);
        should_stop.store(false, Ordering::SeqCst);

        let segment_bytes = self.segment_bytes;
        let interval = self.interval;
        let handle = thread::spawn(move || {
            let mut sequence = 0u64;
            while !should_stop.load(Ordering::SeqCst) {
                let data = Bytes::from(vec![(sequence % 251) as u8; segment_bytes]);
                let segment = CapturedSegment::new(data, sequence);
                if sender.send(SourceMessage::Segment(segment)).is_err() {
                    warn!("Synthetic source receiver dropped");
                    break;
                }
                sequence += 1;
                thread::sleep(interval);
            }
        });

        *self.thread.lock() = Some(handle);
        Ok(receiver)
    }

    fn stop(&mut self) -> CaptureResult<()> {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.thread.lock().is_some()
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_prefers_vp9() {
        let (source, _feed) = ChannelSource::new(&["video/mp4", "video/webm;codecs=vp9,opus"]);
        assert_eq!(
            negotiate_mime_type(&source).unwrap(),
            "video/webm;codecs=vp9,opus"
        );
    }

    #[test]
    fn negotiation_fails_without_common_format() {
        let (source, _feed) = ChannelSource::new(&["audio/ogg"]);
        assert!(matches!(
            negotiate_mime_type(&source),
            Err(CaptureError::Unsupported(_))
        ));
    }

    #[test]
    fn channel_source_starts_once() {
        let (mut source, _feed) = ChannelSource::new(&["video/webm"]);
        assert!(source.start("video/webm").is_ok());
        assert!(source.start("video/webm").is_err());
    }
}
