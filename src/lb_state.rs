use std::pin::Pin;

use actix_web::HttpResponse;
use actix_web::http::StatusCode as ActixStatusCode;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{Value, json};

use crate::client_pool::{ClientHandle, ClientPool};
use crate::config::ProxyConfig;
use crate::context::{DispatchState, RequestContext};
use crate::error::DispatchError;
use crate::io_struct::{CompletionRequest, PrefillResponse};
use crate::strategy_lb::{EngineInfo, EngineType};
use crate::timing::{
    CLIENT_DISCONNECT, Checkpoint, DECODE_REQUEST_START, FIRST_TOKEN, PREFILL_REQUEST_END,
    PREFILL_REQUEST_START, PREFILL_TIMING, PROXY_START, PhaseLog, REQUEST_COMPLETE,
    REQUEST_ERROR, TIMING_BREAKDOWN, rewrite_first_chunk_timing,
};

const DEFAULT_CONTENT_TYPE: &str = "application/json";

type UpstreamStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Server-wide state shared by every request handler.
///
/// Only the selector cursors inside the pool are mutated after startup.
#[derive(Debug)]
pub struct ProxyState {
    pub pool: ClientPool,
}

impl ProxyState {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        Ok(Self::from_pool(ClientPool::new(config)?))
    }

    pub fn from_pool(pool: ClientPool) -> Self {
        Self { pool }
    }

    pub fn healthcheck(&self) -> Value {
        json!({
            "status": "ok",
            "prefill_instances": self.pool.instance_count(EngineType::Prefill),
            "decode_instances": self.pool.instance_count(EngineType::Decode),
        })
    }

    /// Runs one request through prefill, then streams the decode response.
    ///
    /// The returned response relays decode chunks as they arrive. Dropping it
    /// (caller disconnect) drops the upstream decode connection.
    pub async fn dispatch(
        &self,
        api_path: &str,
        payload: CompletionRequest,
    ) -> Result<HttpResponse, DispatchError> {
        let mut ctx = RequestContext::new(payload);
        log::info!(
            "{}",
            PhaseLog::new(PROXY_START, &ctx.request_id).field(
                "proxy_start_ms",
                ctx.checkpoints.get(Checkpoint::ProxyStart).unwrap_or_default()
            )
        );

        let prefill = self.pool.get_client(EngineType::Prefill);
        if let Err(e) = self.prefill(&mut ctx, &prefill, api_path).await {
            return Err(fail_request(&mut ctx, prefill.engine(), e));
        }

        let decode = self.pool.get_client(EngineType::Decode);
        let response = match self.open_decode(&mut ctx, &decode, api_path).await {
            Ok(response) => response,
            Err(e) => return Err(fail_request(&mut ctx, decode.engine(), e)),
        };

        let status = ActixStatusCode::from_u16(response.status().as_u16())
            .unwrap_or(ActixStatusCode::OK);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let relay = DecodeRelay::new(ctx, decode.engine().clone(), Box::pin(response.bytes_stream()));

        Ok(HttpResponse::build(status)
            .content_type(content_type)
            .streaming(relay.into_stream()))
    }

    async fn prefill(
        &self,
        ctx: &mut RequestContext,
        client: &ClientHandle,
        api_path: &str,
    ) -> Result<(), DispatchError> {
        let request = ctx.payload.force_prefill_fields();
        ctx.advance(DispatchState::PrefillSent);
        let prefill_start_ms = ctx.checkpoints.record(Checkpoint::PrefillStart);
        log::info!(
            "{}",
            PhaseLog::new(PREFILL_REQUEST_START, &ctx.request_id)
                .field("prefill_start_ms", prefill_start_ms)
                .field("endpoint", client.engine().address())
        );

        let response =
            route_one(client, EngineType::Prefill, api_path, &request, &ctx.request_id).await?;
        let body = response
            .bytes()
            .await
            .map_err(|source| DispatchError::UpstreamConnection {
                phase: EngineType::Prefill,
                endpoint: client.engine().address(),
                source,
            })?;

        let prefill_end_ms = ctx.checkpoints.record(Checkpoint::PrefillEnd);
        ctx.advance(DispatchState::PrefillDone);
        log::info!(
            "{}",
            PhaseLog::new(PREFILL_REQUEST_END, &ctx.request_id)
                .field("prefill_end_ms", prefill_end_ms)
                .field(
                    "prefill_duration_ms",
                    ctx.checkpoints
                        .elapsed(Checkpoint::PrefillStart, Checkpoint::PrefillEnd)
                        .unwrap_or_default()
                )
        );

        let parsed = PrefillResponse::from_slice(&body).map_err(|source| {
            DispatchError::InvalidPrefillResponse {
                endpoint: client.engine().address(),
                source,
            }
        })?;
        if parsed.kv_transfer_params.is_none() {
            log::debug!(
                "Prefill response for request_id={} carried no kv_transfer_params",
                ctx.request_id
            );
        }
        ctx.kv_transfer_params = parsed.kv_transfer_params;
        ctx.prefill_timing = parsed.timing;
        if let Some(timing) = &ctx.prefill_timing {
            log::info!(
                "{}",
                PhaseLog::new(PREFILL_TIMING, &ctx.request_id)
                    .field("prefill_queued_ms", format!("{:.1}", timing.queued_ms()))
                    .field("prefill_execute_ms", format!("{:.1}", timing.execute_ms()))
            );
        }
        Ok(())
    }

    async fn open_decode(
        &self,
        ctx: &mut RequestContext,
        client: &ClientHandle,
        api_path: &str,
    ) -> Result<reqwest::Response, DispatchError> {
        let request = ctx
            .payload
            .merge_kv_transfer_params(ctx.kv_transfer_params.as_ref());
        let decode_start_ms = ctx.checkpoints.record(Checkpoint::DecodeStart);
        ctx.advance(DispatchState::DecodeSent);
        log::info!(
            "{}",
            PhaseLog::new(DECODE_REQUEST_START, &ctx.request_id)
                .field("decode_start_ms", decode_start_ms)
                .field(
                    "prefill_to_decode_gap_ms",
                    ctx.checkpoints
                        .elapsed(Checkpoint::PrefillEnd, Checkpoint::DecodeStart)
                        .unwrap_or_default()
                )
                .field("endpoint", client.engine().address())
        );

        let response =
            route_one(client, EngineType::Decode, api_path, &request, &ctx.request_id).await?;
        ctx.advance(DispatchState::Streaming);
        Ok(response)
    }
}

/// Sends one request and turns a non-2xx answer into an error carrying the
/// backend's status and body.
async fn route_one<T: Serialize + ?Sized>(
    client: &ClientHandle,
    phase: EngineType,
    api_path: &str,
    request: &T,
    request_id: &str,
) -> Result<reqwest::Response, DispatchError> {
    let endpoint = client.engine().address();
    let response = client
        .post(api_path, request, request_id)?
        .send()
        .await
        .map_err(|source| DispatchError::UpstreamConnection {
            phase,
            endpoint: endpoint.clone(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.unwrap_or_default();
        return Err(DispatchError::UpstreamStatus {
            phase,
            endpoint,
            status,
            body,
            content_type,
        });
    }
    Ok(response)
}

fn fail_request(ctx: &mut RequestContext, engine: &EngineInfo, error: DispatchError) -> DispatchError {
    let state = ctx.state();
    ctx.fail();
    let mut line = PhaseLog::new(REQUEST_ERROR, &ctx.request_id)
        .field("phase", error.phase())
        .field("state", state)
        .field("endpoint", engine);
    if let DispatchError::UpstreamStatus { body, .. } = &error {
        line = line.field("body", String::from_utf8_lossy(body));
    }
    log::error!("{} error={}", line, error);
    error
}

/// Relays the decode stream to the caller, timestamping the first chunk and
/// injecting the merged timing block into it.
struct DecodeRelay {
    ctx: RequestContext,
    engine: EngineInfo,
    upstream: UpstreamStream,
}

impl DecodeRelay {
    fn new(ctx: RequestContext, engine: EngineInfo, upstream: UpstreamStream) -> Self {
        Self {
            ctx,
            engine,
            upstream,
        }
    }

    fn into_stream(self) -> impl Stream<Item = Result<Bytes, DispatchError>> + 'static {
        stream::unfold(Some(self), |relay| async move {
            let mut relay = relay?;
            match relay.upstream.next().await {
                Some(Ok(chunk)) => {
                    let chunk = relay.on_chunk(chunk);
                    Some((Ok(chunk), Some(relay)))
                }
                Some(Err(source)) => {
                    let error = relay.on_error(source);
                    Some((Err(error), None))
                }
                None => {
                    relay.on_complete();
                    None
                }
            }
        })
    }

    fn on_chunk(&mut self, chunk: Bytes) -> Bytes {
        if self.ctx.checkpoints.get(Checkpoint::FirstToken).is_some() {
            return chunk;
        }

        let first_token_ms = self.ctx.checkpoints.record(Checkpoint::FirstToken);
        log::info!(
            "{}",
            PhaseLog::new(FIRST_TOKEN, &self.ctx.request_id)
                .field("first_token_ms", first_token_ms)
                .field(
                    "decode_queue_time_ms",
                    self.ctx
                        .checkpoints
                        .elapsed(Checkpoint::DecodeStart, Checkpoint::FirstToken)
                        .unwrap_or_default()
                )
        );

        let Some(prefill_timing) = self.ctx.prefill_timing else {
            return chunk;
        };
        match rewrite_first_chunk_timing(&chunk, &prefill_timing) {
            Ok(Some(rewritten)) => {
                self.ctx.decode_timing = Some(rewritten.decode_timing);
                rewritten.bytes
            }
            Ok(None) => chunk,
            Err(e) => {
                log::warn!(
                    "Failed to inject timing info for request_id={}: {}",
                    self.ctx.request_id,
                    e
                );
                chunk
            }
        }
    }

    fn on_error(&mut self, source: reqwest::Error) -> DispatchError {
        let error = DispatchError::StreamInterrupted {
            endpoint: self.engine.address(),
            source,
        };
        fail_request(&mut self.ctx, &self.engine, error)
    }

    fn on_complete(mut self) {
        let completion_ms = self.ctx.checkpoints.record(Checkpoint::Completion);
        self.ctx.advance(DispatchState::Completed);
        log::info!(
            "{}",
            PhaseLog::new(REQUEST_COMPLETE, &self.ctx.request_id)
                .field("completion_time_ms", completion_ms)
                .field(
                    "total_duration_ms",
                    self.ctx
                        .checkpoints
                        .elapsed(Checkpoint::ProxyStart, Checkpoint::Completion)
                        .unwrap_or_default()
                )
        );
        log::debug!(
            "{} {}",
            PhaseLog::new(TIMING_BREAKDOWN, &self.ctx.request_id),
            self.ctx.breakdown()
        );
    }
}

impl Drop for DecodeRelay {
    fn drop(&mut self) {
        if !self.ctx.state().is_terminal() {
            log::info!(
                "{} endpoint={}",
                PhaseLog::new(CLIENT_DISCONNECT, &self.ctx.request_id)
                    .field("state", self.ctx.state()),
                self.engine
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::BackendTiming;

    const DONE: &[u8] = b"data: [DONE]\n\n";
    const EMPTY_EVENT: &[u8] = b"data: {}\n\n";

    fn relay_over(chunks: Vec<&'static [u8]>, prefill_timing: Option<BackendTiming>) -> DecodeRelay {
        relay_over_items(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect(),
            prefill_timing,
        )
    }

    fn relay_over_items(
        items: Vec<reqwest::Result<Bytes>>,
        prefill_timing: Option<BackendTiming>,
    ) -> DecodeRelay {
        let mut ctx = RequestContext::new(CompletionRequest::default());
        for next in [
            DispatchState::PrefillSent,
            DispatchState::PrefillDone,
            DispatchState::DecodeSent,
            DispatchState::Streaming,
        ] {
            ctx.advance(next);
        }
        ctx.checkpoints.record(Checkpoint::DecodeStart);
        ctx.prefill_timing = prefill_timing;
        DecodeRelay::new(
            ctx,
            EngineInfo::new(EngineType::Decode, "h2", 8200, 0),
            Box::pin(stream::iter(items)),
        )
    }

    fn transport_error() -> reqwest::Error {
        reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err()
    }

    async fn collect(relay: DecodeRelay) -> Vec<Bytes> {
        relay
            .into_stream()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[actix_web::test]
    async fn test_only_first_chunk_is_rewritten() {
        let first: &'static [u8] =
            b"data: {\"vllm_timing\":{\"queued_time\":0.01,\"execute_time\":0.05}}\n\n";
        let second: &'static [u8] =
            b"data: {\"vllm_timing\":{\"queued_time\":0.03,\"execute_time\":0.07}}\n\n";
        let relay = relay_over(
            vec![first, second, DONE],
            Some(BackendTiming {
                queued_time: Some(0.02),
                execute_time: Some(0.08),
            }),
        );
        let chunks = collect(relay).await;
        assert_eq!(chunks.len(), 3);

        let event: Value = serde_json::from_slice(
            chunks[0].strip_prefix(b"data: ".as_slice()).unwrap(),
        )
        .unwrap();
        assert_eq!(
            event["vllm_timing"],
            json!({
                "prefill_queued_time": 0.02,
                "prefill_execute_time": 0.08,
                "decode_queued_time": 0.01,
                "decode_execute_time": 0.05,
            })
        );
        assert_eq!(chunks[1], Bytes::from_static(second));
        assert_eq!(chunks[2], Bytes::from_static(DONE));
    }

    #[actix_web::test]
    async fn test_malformed_first_chunk_forwarded_unchanged() {
        let first: &'static [u8] = b"data: {\"vllm_timing\": oops\n\n";
        let relay = relay_over(
            vec![first, DONE],
            Some(BackendTiming::default()),
        );
        let chunks = collect(relay).await;
        assert_eq!(chunks[0], Bytes::from_static(first));
    }

    #[actix_web::test]
    async fn test_no_rewrite_without_prefill_timing() {
        let first: &'static [u8] =
            b"data: {\"vllm_timing\":{\"queued_time\":0.01,\"execute_time\":0.05}}\n\n";
        let chunks = collect(relay_over(vec![first], None)).await;
        assert_eq!(chunks, vec![Bytes::from_static(first)]);
    }

    #[actix_web::test]
    async fn test_first_token_recorded_once() {
        let mut relay = relay_over(vec![EMPTY_EVENT], None);
        relay.on_chunk(Bytes::from_static(EMPTY_EVENT));
        let first_token = relay.ctx.checkpoints.get(Checkpoint::FirstToken);
        assert!(first_token.is_some());
        actix_web::rt::time::sleep(std::time::Duration::from_millis(5)).await;
        relay.on_chunk(Bytes::from_static(EMPTY_EVENT));
        assert_eq!(relay.ctx.checkpoints.get(Checkpoint::FirstToken), first_token);
        assert_eq!(relay.ctx.state(), DispatchState::Streaming);
    }

    #[actix_web::test]
    async fn test_relay_reaches_completed() {
        let mut stream = Box::pin(relay_over(vec![EMPTY_EVENT, DONE], None).into_stream());
        let mut relayed = Vec::new();
        while let Some(chunk) = stream.next().await {
            relayed.push(chunk.unwrap());
        }
        assert_eq!(relayed, vec![Bytes::from_static(EMPTY_EVENT), Bytes::from_static(DONE)]);
    }

    #[actix_web::test]
    async fn test_upstream_error_ends_relay() {
        let relay = relay_over_items(
            vec![Ok(Bytes::from_static(EMPTY_EVENT)), Err(transport_error())],
            None,
        );
        let items: Vec<_> = relay.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(EMPTY_EVENT));
        assert!(matches!(
            items[1],
            Err(DispatchError::StreamInterrupted { .. })
        ));
    }

    #[test]
    fn test_upstream_error_marks_request_errored() {
        let mut relay = relay_over(vec![], None);
        let error = relay.on_error(transport_error());
        assert_eq!(error.phase(), EngineType::Decode);
        assert_eq!(relay.ctx.state(), DispatchState::Errored);
    }

    #[test]
    fn test_healthcheck_reports_instance_counts() {
        let config = ProxyConfig {
            decoder_hosts: vec!["d0".to_string(), "d1".to_string()],
            decoder_ports: vec![8200, 8201],
            ..Default::default()
        };
        let state = ProxyState::new(&config).unwrap();
        assert_eq!(
            state.healthcheck(),
            json!({"status": "ok", "prefill_instances": 1, "decode_instances": 2})
        );
    }
}
