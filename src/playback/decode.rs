//! Payload decoding: base64 → container sniff → PCM → mono at the output rate.

use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine as _;

use super::unit::DecodedClip;
use crate::error::{LiveError, Result};
use crate::step::AudioPayload;

/// Turns an encoded payload into playable PCM.
#[async_trait]
pub trait ClipDecoder: Send + Sync {
    /// Decode one payload.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Decode`] for corrupt or unsupported audio.
    async fn decode(&self, payload: &AudioPayload) -> Result<DecodedClip>;
}

/// Production decoder backed by `symphonia`.
///
/// Decoding runs on the blocking pool so it never stalls network or queue tasks.
#[derive(Debug, Clone)]
pub struct SymphoniaDecoder {
    target_rate: u32,
}

impl SymphoniaDecoder {
    /// Decode to mono at `target_rate` Hz.
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }
}

#[async_trait]
impl ClipDecoder for SymphoniaDecoder {
    async fn decode(&self, payload: &AudioPayload) -> Result<DecodedClip> {
        let payload = payload.clone();
        let target_rate = self.target_rate;
        tokio::task::spawn_blocking(move || decode_payload(payload.as_str(), target_rate))
            .await
            .map_err(|e| LiveError::Decode(format!("decode task failed: {e}")))?
    }
}

/// Decode a base64 (or `data:` URI) payload synchronously.
pub fn decode_payload(encoded: &str, target_rate: u32) -> Result<DecodedClip> {
    let bytes = decode_base64(encoded)?;
    let extension = sniff_extension(&bytes);
    let (samples, native_rate) = decode_to_mono(bytes, extension)?;
    if samples.is_empty() {
        return Err(LiveError::Decode("payload contains no audio samples".into()));
    }
    if target_rate == 0 {
        return Ok(DecodedClip::new(samples, native_rate));
    }
    Ok(DecodedClip::new(
        resample_linear_mono(&samples, native_rate, target_rate),
        target_rate,
    ))
}

fn strip_data_uri(encoded: &str) -> &str {
    let trimmed = encoded.trim();
    match trimmed.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, body)| body),
        None => trimmed,
    }
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    let body = strip_data_uri(encoded);
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(LiveError::Decode("empty payload".into()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| LiveError::Decode(format!("invalid base64: {e}")))
}

/// Guess the container from magic bytes.
pub(crate) fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => Some("wav"),
        [b'I', b'D', b'3', ..] => Some("mp3"),
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => Some("m4a"),
        // ADTS AAC shares the 12-bit sync with MPEG audio; layer bits are zero.
        [0xFF, b, ..] if b & 0xF6 == 0xF0 => Some("aac"),
        [0xFF, b, ..] if b & 0xE0 == 0xE0 => Some("mp3"),
        _ => None,
    }
}

fn decode_to_mono(bytes: Vec<u8>, extension: Option<&str>) -> Result<(Vec<f32>, u32)> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| LiveError::Decode(format!("unrecognized audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| LiveError::Decode("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| LiveError::Decode("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| LiveError::Decode(format!("unsupported codec: {e}")))?;

    let mut out: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(LiveError::Decode(format!("read error: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // A corrupt frame is skipped, not fatal.
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(LiveError::Decode(format!("decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let frames = decoded.frames() as u64;
        let required = usize::try_from(frames)
            .unwrap_or(usize::MAX)
            .saturating_mul(channels);

        match sample_buf.as_mut() {
            Some(b) if b.capacity() >= required => b.clear(),
            _ => sample_buf = Some(SampleBuffer::<f32>::new(frames, spec)),
        }

        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);

        let data = buf.samples();
        if channels <= 1 {
            out.extend_from_slice(data);
        } else {
            out.extend(
                data.chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }
    }

    Ok((out, sample_rate))
}

/// Linear-interpolation resampler for mono audio.
pub(crate) fn resample_linear_mono(input: &[f32], from_sr: u32, to_sr: u32) -> Vec<f32> {
    if input.is_empty() || from_sr == to_sr || from_sr == 0 {
        return input.to_vec();
    }

    let ratio = f64::from(to_sr) / f64::from(from_sr);
    let out_len = ((input.len() as f64) * ratio).round() as usize;
    let last = input.len() - 1;
    let at = |i: usize| input[i.min(last)];

    (0..out_len)
        .map(|i| {
            let src_pos = (i as f64) / ratio;
            let i0 = src_pos.floor() as usize;
            let t = (src_pos - i0 as f64) as f32;
            at(i0) * (1.0 - t) + at(i0 + 1) * t
        })
        .collect()
}
