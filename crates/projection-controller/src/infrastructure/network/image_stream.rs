//! Frame-draining task for the image channel.
//!
//! The streaming helper writes frames as `[len: u32 BE][len bytes]`.
//! [`drain_frames`] reads them with a `LengthDelimitedCodec` and hands each
//! one to the session registered for the device.  It returns when the stream
//! ends or fails; reconnecting is the owner's job.

use std::sync::Arc;

use futures_util::StreamExt;
use projection_core::DeviceId;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use super::image_session::{ImageSessionError, ImageSessionRegistry};

/// Why the draining task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The helper closed the stream.
    Eof { frames: u64 },
    /// Reading or framing failed.
    ReadError { frames: u64, error: String },
}

impl StreamEnd {
    pub fn frames(&self) -> u64 {
        match self {
            StreamEnd::Eof { frames } | StreamEnd::ReadError { frames, .. } => *frames,
        }
    }
}

/// Codec for `u32` big-endian length-prefixed frames up to `max_frame_bytes`.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// Reads frames from `reader` until it ends, routing each to the session
/// currently registered for `device_id`.
///
/// Frames arriving while no session is registered, or that the session
/// rejects, are dropped.
pub async fn drain_frames<R>(
    reader: R,
    device_id: DeviceId,
    sessions: Arc<ImageSessionRegistry>,
    max_frame_bytes: usize,
) -> StreamEnd
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, frame_codec(max_frame_bytes));
    let mut count: u64 = 0;

    while let Some(next) = frames.next().await {
        match next {
            Ok(frame) => {
                count += 1;
                let Some(session) = sessions.get(&device_id) else {
                    trace!(device = %device_id, "no image session; frame dropped");
                    continue;
                };
                match session.write_image_data(frame.freeze()) {
                    Ok(()) => {}
                    Err(ImageSessionError::SinkFull) => {
                        trace!(device = %device_id, "viewer behind; frame dropped")
                    }
                    Err(ImageSessionError::Closed) => {
                        trace!(device = %device_id, "image session closed; frame dropped")
                    }
                }
            }
            Err(e) => {
                warn!(device = %device_id, frames = count, "image stream read failed: {e}");
                return StreamEnd::ReadError {
                    frames: count,
                    error: e.to_string(),
                };
            }
        }
    }

    debug!(device = %device_id, frames = count, "image stream ended");
    StreamEnd::Eof { frames: count }
}
