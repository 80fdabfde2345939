//! Phase checkpoints, the derived latency breakdown and the merged
//! `vllm_timing` block injected into the first decode chunk.
//!
//! Timestamps are epoch milliseconds so log lines from the proxy can be lined
//! up with backend logs.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::MetadataInjectionError;
use crate::io_struct::VLLM_TIMING;

pub const SSE_DATA_PREFIX: &str = "data: ";
pub const SSE_DONE: &str = "[DONE]";

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    ProxyStart,
    PrefillStart,
    PrefillEnd,
    DecodeStart,
    FirstToken,
    Completion,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoints {
    proxy_start: Option<i64>,
    prefill_start: Option<i64>,
    prefill_end: Option<i64>,
    decode_start: Option<i64>,
    first_token: Option<i64>,
    completion: Option<i64>,
}

impl Checkpoints {
    /// Reads the clock and stores it under `checkpoint`.
    pub fn record(&mut self, checkpoint: Checkpoint) -> i64 {
        let now = now_ms();
        self.set(checkpoint, now);
        now
    }

    pub fn set(&mut self, checkpoint: Checkpoint, at_ms: i64) {
        *self.slot(checkpoint) = Some(at_ms);
    }

    pub fn get(&self, checkpoint: Checkpoint) -> Option<i64> {
        match checkpoint {
            Checkpoint::ProxyStart => self.proxy_start,
            Checkpoint::PrefillStart => self.prefill_start,
            Checkpoint::PrefillEnd => self.prefill_end,
            Checkpoint::DecodeStart => self.decode_start,
            Checkpoint::FirstToken => self.first_token,
            Checkpoint::Completion => self.completion,
        }
    }

    pub fn elapsed(&self, from: Checkpoint, to: Checkpoint) -> Option<i64> {
        Some(self.get(to)? - self.get(from)?)
    }

    fn slot(&mut self, checkpoint: Checkpoint) -> &mut Option<i64> {
        match checkpoint {
            Checkpoint::ProxyStart => &mut self.proxy_start,
            Checkpoint::PrefillStart => &mut self.prefill_start,
            Checkpoint::PrefillEnd => &mut self.prefill_end,
            Checkpoint::DecodeStart => &mut self.decode_start,
            Checkpoint::FirstToken => &mut self.first_token,
            Checkpoint::Completion => &mut self.completion,
        }
    }
}

/// Sub-phase timings an engine reports under `vllm_timing`, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct BackendTiming {
    pub queued_time: Option<f64>,
    pub execute_time: Option<f64>,
}

impl BackendTiming {
    /// `None` unless `value` is an object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let timing = value.as_object()?;
        Some(Self {
            queued_time: timing.get("queued_time").and_then(Value::as_f64),
            execute_time: timing.get("execute_time").and_then(Value::as_f64),
        })
    }

    pub fn queued_ms(&self) -> f64 {
        self.queued_time.unwrap_or(0.0) * 1000.0
    }

    pub fn execute_ms(&self) -> f64 {
        self.execute_time.unwrap_or(0.0) * 1000.0
    }
}

/// Durations derived from a request's checkpoints. Emitted, never stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingBreakdown {
    pub prefill_duration_ms: Option<i64>,
    pub prefill_to_decode_gap_ms: Option<i64>,
    pub decode_queue_time_ms: Option<i64>,
    pub total_duration_ms: Option<i64>,
    pub prefill: Option<BackendTiming>,
    pub decode: Option<BackendTiming>,
}

impl TimingBreakdown {
    pub fn new(
        checkpoints: &Checkpoints,
        prefill: Option<BackendTiming>,
        decode: Option<BackendTiming>,
    ) -> Self {
        Self {
            prefill_duration_ms: checkpoints.elapsed(Checkpoint::PrefillStart, Checkpoint::PrefillEnd),
            prefill_to_decode_gap_ms: checkpoints
                .elapsed(Checkpoint::PrefillEnd, Checkpoint::DecodeStart),
            decode_queue_time_ms: checkpoints.elapsed(Checkpoint::DecodeStart, Checkpoint::FirstToken),
            total_duration_ms: checkpoints.elapsed(Checkpoint::ProxyStart, Checkpoint::Completion),
            prefill,
            decode,
        }
    }
}

impl fmt::Display for TimingBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let durations = [
            ("prefill_duration_ms", self.prefill_duration_ms),
            ("prefill_to_decode_gap_ms", self.prefill_to_decode_gap_ms),
            ("decode_queue_time_ms", self.decode_queue_time_ms),
            ("total_duration_ms", self.total_duration_ms),
        ];
        let mut parts: Vec<String> = durations
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| format!("{}={}", name, v)))
            .collect();
        for (phase, timing) in [("prefill", self.prefill), ("decode", self.decode)] {
            if let Some(timing) = timing {
                parts.push(format!(
                    "{phase}_queued_ms={:.1} {phase}_execute_ms={:.1}",
                    timing.queued_ms(),
                    timing.execute_ms()
                ));
            }
        }
        f.write_str(&parts.join(" "))
    }
}

pub const PROXY_START: &str = "PROXY_START";
pub const PREFILL_REQUEST_START: &str = "PREFILL_REQUEST_START";
pub const PREFILL_REQUEST_END: &str = "PREFILL_REQUEST_END";
pub const PREFILL_TIMING: &str = "PREFILL_TIMING";
pub const DECODE_REQUEST_START: &str = "DECODE_REQUEST_START";
pub const FIRST_TOKEN: &str = "FIRST_TOKEN";
pub const REQUEST_COMPLETE: &str = "REQUEST_COMPLETE";
pub const TIMING_BREAKDOWN: &str = "TIMING_BREAKDOWN";
pub const REQUEST_ERROR: &str = "REQUEST_ERROR";
pub const CLIENT_DISCONNECT: &str = "CLIENT_DISCONNECT";

/// One phase-marker log line: `[MARKER] request_id=<id> key=value ...`.
///
/// The analysis scripts parse these lines, so keys and marker names are
/// stable.
#[derive(Debug, Clone)]
pub struct PhaseLog<'a> {
    marker: &'static str,
    request_id: &'a str,
    fields: Vec<(&'static str, String)>,
}

impl<'a> PhaseLog<'a> {
    pub fn new(marker: &'static str, request_id: &'a str) -> Self {
        Self {
            marker,
            request_id,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }
}

impl fmt::Display for PhaseLog<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] request_id={}", self.marker, self.request_id)?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenChunk {
    pub bytes: Bytes,
    pub decode_timing: BackendTiming,
}

/// Replaces the decode engine's `vllm_timing` in a `data: <json>` event with
/// the combined prefill and decode block.
///
/// Returns `Ok(None)` for chunks that are not timing-bearing events at all
/// (non-SSE bodies, empty events, `[DONE]`), and an error when the chunk looks
/// like an event but cannot be rewritten.
pub fn rewrite_first_chunk_timing(
    chunk: &[u8],
    prefill: &BackendTiming,
) -> Result<Option<RewrittenChunk>, MetadataInjectionError> {
    let text = std::str::from_utf8(chunk)?;
    let Some(data) = text.strip_prefix(SSE_DATA_PREFIX) else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == SSE_DONE {
        return Ok(None);
    }

    let mut event: Value = serde_json::from_str(data)?;
    let event_map = event
        .as_object_mut()
        .ok_or(MetadataInjectionError::NotAnObject)?;
    let decode = event_map
        .get(VLLM_TIMING)
        .and_then(Value::as_object)
        .ok_or(MetadataInjectionError::MissingTiming)?;
    let (Some(decode_queued), Some(decode_execute)) =
        (decode.get("queued_time"), decode.get("execute_time"))
    else {
        return Err(MetadataInjectionError::MissingTiming);
    };
    let decode_timing = BackendTiming {
        queued_time: decode_queued.as_f64(),
        execute_time: decode_execute.as_f64(),
    };

    let merged = json!({
        "prefill_queued_time": prefill.queued_time,
        "prefill_execute_time": prefill.execute_time,
        "decode_queued_time": decode_queued.clone(),
        "decode_execute_time": decode_execute.clone(),
    });
    event_map.insert(VLLM_TIMING.to_string(), merged);

    let bytes = Bytes::from(format!("{}{}\n\n", SSE_DATA_PREFIX, serde_json::to_string(&event)?));
    Ok(Some(RewrittenChunk {
        bytes,
        decode_timing,
    }))
}
