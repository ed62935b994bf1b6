//! Audio playback: ordered, gapless output of decoded speech segments.
//!
//! ```text
//! enqueue ─▶ Queued ─▶ Decoding ─▶ Decoded ─▶ Playing ─▶ Finished
//!                         │   (ClipDecoder)   (AudioSink)
//!                         └──▶ Failed ─▶ PlaybackEvent::Error, next unit
//! ```
//!
//! While one unit sounds the next is decoded and handed to the sink, so the
//! sink can start it on the sample after the current one ends.

pub mod cpal_sink;
pub mod decode;
pub mod queue;
pub mod sink;
pub mod unit;

pub use cpal_sink::{CpalSink, list_output_devices};
pub use decode::{ClipDecoder, SymphoniaDecoder, decode_payload};
pub use queue::{PlaybackEvent, PlaybackQueue, QueueStatus};
pub use sink::{AudioSink, Segment, SilentSink, SinkEvent, Timeline};
pub use unit::{DecodedClip, UnitId, UnitState};
