use log::LevelFilter;

use crate::error::{ConfigError, ConfigResult};
use crate::strategy_lb::{EngineInfo, EngineType};

pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub prefiller_hosts: Vec<String>,
    pub prefiller_ports: Vec<u16>,
    pub decoder_hosts: Vec<String>,
    pub decoder_ports: Vec<u16>,
    /// Sent to backends as a bearer token.
    pub api_key: Option<String>,
    /// Optional per-backend-request timeout. `None` means wait forever.
    pub timeout_secs: Option<u64>,
    pub max_payload_size: usize,
    pub log_level: LevelFilter,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            prefiller_hosts: vec!["localhost".to_string()],
            prefiller_ports: vec![8100],
            decoder_hosts: vec!["localhost".to_string()],
            decoder_ports: vec![8200],
            api_key: None,
            timeout_secs: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            log_level: LevelFilter::Info,
        }
    }
}

impl ProxyConfig {
    /// Pairs the configured hosts and ports of one role into endpoints.
    pub fn endpoints(&self, role: EngineType) -> ConfigResult<Vec<EngineInfo>> {
        let (hosts, ports) = match role {
            EngineType::Prefill => (&self.prefiller_hosts, &self.prefiller_ports),
            EngineType::Decode => (&self.decoder_hosts, &self.decoder_ports),
        };
        if hosts.len() != ports.len() {
            return Err(ConfigError::MismatchedEndpoints {
                role,
                hosts: hosts.len(),
                ports: ports.len(),
            });
        }
        if hosts.is_empty() {
            return Err(ConfigError::NoEndpoints { role });
        }
        Ok(hosts
            .iter()
            .zip(ports.iter())
            .enumerate()
            .map(|(index, (host, port))| EngineInfo::new(role, host.clone(), *port, index))
            .collect())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.endpoints(EngineType::Prefill)?;
        self.endpoints(EngineType::Decode)?;
        if self.max_payload_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_payload_size".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "omit the timeout instead of setting it to zero".to_string(),
            });
        }
        Ok(())
    }
}
