//! Captured segment and artifact types.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

/// One chunk of encoded media emitted by a source.
#[derive(Debug, Clone)]
pub struct CapturedSegment {
    /// Encoded container bytes.
    pub data: Bytes,

    /// Monotonically increasing sequence number.
    pub sequence: u64,
}

impl CapturedSegment {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self { data, sequence }
    }
}

/// The result of a recording: every captured segment joined in order.
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    /// Concatenated container bytes.
    pub data: Bytes,

    /// Negotiated container/codec identifier.
    pub mime_type: String,

    /// Wall-clock length of the recording.
    pub duration: Duration,

    /// Number of segments that were joined.
    pub segment_count: usize,
}

impl RecordingArtifact {
    /// Join segments in sequence order.
    pub fn from_segments(
        mut segments: Vec<CapturedSegment>,
        mime_type: impl Into<String>,
        duration: Duration,
    ) -> Self {
        segments.sort_by_key(|s| s.sequence);
        let total = segments.iter().map(|s| s.data.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for segment in &segments {
            buf.extend_from_slice(&segment.data);
        }

        Self {
            data: buf.freeze(),
            mime_type: mime_type.into(),
            duration,
            segment_count: segments.len(),
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// File extension matching the container.
    pub fn file_extension(&self) -> &'static str {
        file_extension(&self.mime_type)
    }
}

/// File extension for a container mime type.
pub fn file_extension(mime_type: &str) -> &'static str {
    let container = mime_type.split(';').next().unwrap_or_default().trim();
    match container {
        "video/mp4" | "audio/mp4" => "mp4",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "webm",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(data: &'static [u8], sequence: u64) -> CapturedSegment {
        CapturedSegment::new(Bytes::from_static(data), sequence)
    }

    #[test]
    fn segments_are_joined_in_sequence_order() {
        let artifact = RecordingArtifact::from_segments(
            vec![segment(b"cd", 1), segment(b"ab", 0)],
            "video/webm",
            Duration::from_secs(1),
        );

        assert_eq!(artifact.data.as_ref(), b"abcd");
        assert_eq!(artifact.segment_count, 2);
        assert_eq!(artifact.byte_size(), 4);
    }

    #[test]
    fn extension_follows_container() {
        assert_eq!(file_extension("video/webm;codecs=vp9,opus"), "webm");
        assert_eq!(file_extension("video/mp4"), "mp4");
        assert_eq!(file_extension("image/jpeg"), "jpg");
    }
}
