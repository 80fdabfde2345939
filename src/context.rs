use std::fmt;

use serde_json::{Map, Value};

use crate::io_struct::CompletionRequest;
use crate::timing::{BackendTiming, Checkpoint, Checkpoints, TimingBreakdown};

/// Progress of one request through the prefill then decode handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Started,
    PrefillSent,
    PrefillDone,
    DecodeSent,
    Streaming,
    Completed,
    Errored,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Started => "STARTED",
            DispatchState::PrefillSent => "PREFILL_SENT",
            DispatchState::PrefillDone => "PREFILL_DONE",
            DispatchState::DecodeSent => "DECODE_SENT",
            DispatchState::Streaming => "STREAMING",
            DispatchState::Completed => "COMPLETED",
            DispatchState::Errored => "ERRORED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchState::Completed | DispatchState::Errored)
    }

    pub fn can_transition_to(&self, next: DispatchState) -> bool {
        use DispatchState::*;
        match (*self, next) {
            (from, Errored) => !from.is_terminal(),
            (Started, PrefillSent)
            | (PrefillSent, PrefillDone)
            | (PrefillDone, DecodeSent)
            | (DecodeSent, Streaming)
            | (Streaming, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request state carried from the prefill hop into the decode hop.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub payload: CompletionRequest,
    pub checkpoints: Checkpoints,
    pub kv_transfer_params: Option<Map<String, Value>>,
    pub prefill_timing: Option<BackendTiming>,
    pub decode_timing: Option<BackendTiming>,
    state: DispatchState,
}

impl RequestContext {
    /// Allocates a request id and records `proxy_start`.
    pub fn new(payload: CompletionRequest) -> Self {
        Self::with_request_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn with_request_id(request_id: String, payload: CompletionRequest) -> Self {
        let mut checkpoints = Checkpoints::default();
        checkpoints.record(Checkpoint::ProxyStart);
        Self {
            request_id,
            payload,
            checkpoints,
            kv_transfer_params: None,
            prefill_timing: None,
            decode_timing: None,
            state: DispatchState::Started,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Moves to `next`. Out-of-order transitions are ignored and logged.
    pub fn advance(&mut self, next: DispatchState) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "Ignoring invalid transition {} -> {} for request_id={}",
                self.state,
                next,
                self.request_id
            );
            return false;
        }
        log::debug!(
            "request_id={} state {} -> {}",
            self.request_id,
            self.state,
            next
        );
        self.state = next;
        true
    }

    pub fn fail(&mut self) -> bool {
        self.advance(DispatchState::Errored)
    }

    pub fn breakdown(&self) -> TimingBreakdown {
        TimingBreakdown::new(&self.checkpoints, self.prefill_timing, self.decode_timing)
    }
}
