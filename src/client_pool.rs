//! One long-lived HTTP session per backend endpoint, grouped by role.
//!
//! A [`ClientHandle`] wraps a `reqwest::Client`, which keeps its own
//! connection pool and multiplexes independent requests, so a single handle is
//! shared by every request routed to its endpoint without serialization.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;

use crate::config::ProxyConfig;
use crate::error::{ConfigError, DispatchError};
use crate::strategy_lb::{EngineInfo, EngineType, RoundRobinPolicy, SelectionPolicy};

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

#[derive(Debug)]
pub struct ClientHandle {
    engine: EngineInfo,
    client: RwLock<Option<reqwest::Client>>,
}

impl ClientHandle {
    pub fn new(engine: EngineInfo, client: reqwest::Client) -> Self {
        Self {
            engine,
            client: RwLock::new(Some(client)),
        }
    }

    pub fn engine(&self) -> &EngineInfo {
        &self.engine
    }

    pub fn is_closed(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Builds a JSON POST against `api_path` under the backend's `/v1` root.
    pub fn post<T: Serialize + ?Sized>(
        &self,
        api_path: &str,
        body: &T,
        request_id: &str,
    ) -> Result<reqwest::RequestBuilder, DispatchError> {
        let client = self
            .client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DispatchError::PoolClosed {
                role: self.engine.engine_type,
            })?;
        Ok(client
            .post(self.engine.api_path(api_path))
            .header(REQUEST_ID_HEADER, request_id)
            .json(body))
    }

    /// Drops the session. Returns false if it was already closed.
    fn close(&self) -> bool {
        self.client
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }
}

/// The handles of one role plus the cursor that rotates over them.
#[derive(Debug)]
pub struct RolePool {
    handles: Vec<Arc<ClientHandle>>,
    policy: Box<dyn SelectionPolicy>,
}

impl RolePool {
    pub fn new(
        role: EngineType,
        handles: Vec<Arc<ClientHandle>>,
        policy: Box<dyn SelectionPolicy>,
    ) -> Result<Self, ConfigError> {
        if handles.is_empty() {
            return Err(ConfigError::NoEndpoints { role });
        }
        Ok(Self { handles, policy })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn engines(&self) -> Vec<EngineInfo> {
        self.handles.iter().map(|h| h.engine().clone()).collect()
    }

    pub fn next_index(&self) -> usize {
        self.policy.next(self.handles.len())
    }

    pub fn next_client(&self) -> Arc<ClientHandle> {
        self.handles[self.next_index()].clone()
    }

    fn close_all(&self) -> usize {
        self.handles.iter().filter(|h| h.close()).count()
    }
}

#[derive(Debug)]
pub struct ClientPool {
    prefill: RolePool,
    decode: RolePool,
}

impl ClientPool {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let prefill = build_role_pool(config, EngineType::Prefill)?;
        let decode = build_role_pool(config, EngineType::Decode)?;
        Ok(Self::from_role_pools(prefill, decode))
    }

    pub fn from_role_pools(prefill: RolePool, decode: RolePool) -> Self {
        Self { prefill, decode }
    }

    pub fn role(&self, role: EngineType) -> &RolePool {
        match role {
            EngineType::Prefill => &self.prefill,
            EngineType::Decode => &self.decode,
        }
    }

    pub fn instance_count(&self, role: EngineType) -> usize {
        self.role(role).len()
    }

    pub fn next_index(&self, role: EngineType) -> usize {
        self.role(role).next_index()
    }

    pub fn get_client(&self, role: EngineType) -> Arc<ClientHandle> {
        self.role(role).next_client()
    }

    /// Releases every backend session. Safe to call more than once.
    pub fn close_all(&self) {
        let closed = self.prefill.close_all() + self.decode.close_all();
        if closed > 0 {
            log::info!("Closed {} backend client(s)", closed);
        }
    }
}

impl Drop for ClientPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn build_role_pool(config: &ProxyConfig, role: EngineType) -> anyhow::Result<RolePool> {
    let handles = config
        .endpoints(role)?
        .into_iter()
        .map(|engine| -> anyhow::Result<Arc<ClientHandle>> {
            Ok(Arc::new(ClientHandle::new(engine, build_client(config)?)))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(RolePool::new(
        role,
        handles,
        Box::new(RoundRobinPolicy::new()),
    )?)
}

/// Builds a backend session. Connections are opened lazily on first use.
pub fn build_client(config: &ProxyConfig) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &config.api_key {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|_| {
            ConfigError::InvalidValue {
                field: "api_key".to_string(),
                value: "<redacted>".to_string(),
                reason: "contains characters not allowed in an HTTP header".to_string(),
            }
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    let mut builder = reqwest::Client::builder().default_headers(headers);
    if let Some(timeout) = config.timeout_secs {
        builder = builder.timeout(Duration::from_secs(timeout));
    }
    Ok(builder.build()?)
}
