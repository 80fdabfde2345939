use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    Prefill,
    Decode,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Prefill => "prefill",
            EngineType::Decode => "decode",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured backend instance. Immutable once the pool is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub engine_type: EngineType,
    pub host: String,
    pub port: u16,
    pub index: usize,
}

impl EngineInfo {
    pub fn new(engine_type: EngineType, host: impl Into<String>, port: u16, index: usize) -> Self {
        EngineInfo {
            engine_type,
            host: host.into(),
            port,
            index,
        }
    }

    /// OpenAI-compatible API root of the backend.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", self.host, self.port)
    }

    pub fn api_path(&self, api_path: &str) -> String {
        if api_path.starts_with('/') {
            format!("{}{}", self.base_url(), api_path)
        } else {
            format!("{}/{}", self.base_url(), api_path)
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for EngineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]@{}:{}",
            self.engine_type, self.index, self.host, self.port
        )
    }
}

/// Picks the next index into a role's pool.
///
/// Implementations must be safe to call from many in-flight requests at once.
/// `pool_size` is always at least one.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    fn next(&self, pool_size: usize) -> usize;

    fn name(&self) -> &'static str;
}

/// Cycles through the pool in order, starting at index 0.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl SelectionPolicy for RoundRobinPolicy {
    fn next(&self, pool_size: usize) -> usize {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        count % pool_size
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
