use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::timing::BackendTiming;

pub const KV_TRANSFER_PARAMS: &str = "kv_transfer_params";
pub const VLLM_TIMING: &str = "vllm_timing";

/// Tells the prefill engine to keep the KV cache for a remote decoder.
pub fn remote_decode_intent() -> Value {
    json!({
        "do_remote_decode": true,
        "do_remote_prefill": false,
        "remote_engine_id": null,
        "remote_block_ids": null,
        "remote_host": null,
        "remote_port": null,
    })
}

/// An OpenAI-style completion or chat completion body.
///
/// Fields the proxy does not touch are carried through untouched. The phase
/// mutations never modify `self`; each returns the payload for one hop.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CompletionRequest {
    fields: Map<String, Value>,
}

impl CompletionRequest {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Payload for the prefill hop: one token, no streaming, remote decode.
    pub fn force_prefill_fields(&self) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(KV_TRANSFER_PARAMS.to_string(), remote_decode_intent());
        fields.insert("stream".to_string(), Value::Bool(false));
        fields.insert("max_tokens".to_string(), json!(1));
        if fields.contains_key("max_completion_tokens") {
            fields.insert("max_completion_tokens".to_string(), json!(1));
        }
        fields.remove("stream_options");
        Self { fields }
    }

    /// Payload for the decode hop. Caller-supplied params are replaced when
    /// the prefill engine returned its own.
    pub fn merge_kv_transfer_params(&self, params: Option<&Map<String, Value>>) -> Self {
        let mut fields = self.fields.clone();
        if let Some(params) = params {
            fields.insert(KV_TRANSFER_PARAMS.to_string(), Value::Object(params.clone()));
        }
        Self { fields }
    }
}

/// The parts of a prefill response the decode hop depends on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefillResponse {
    /// `None` when missing, null or empty.
    pub kv_transfer_params: Option<Map<String, Value>>,
    /// `None` unless the engine reported a `vllm_timing` object.
    pub timing: Option<BackendTiming>,
}

impl PrefillResponse {
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(body)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let kv_transfer_params = value
            .get(KV_TRANSFER_PARAMS)
            .and_then(Value::as_object)
            .filter(|params| !params.is_empty())
            .cloned();
        let timing = value.get(VLLM_TIMING).and_then(BackendTiming::from_value);
        Self {
            kv_transfer_params,
            timing,
        }
    }
}
