// These modules are used by the integration tests
#![allow(dead_code)]

pub mod mock_backend;

use disagg_proxy::ProxyConfig;

/// Proxy config pointing at local mock engines.
pub fn local_config(prefill_ports: &[u16], decode_ports: &[u16]) -> ProxyConfig {
    ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        prefiller_hosts: vec!["127.0.0.1".to_string(); prefill_ports.len()],
        prefiller_ports: prefill_ports.to_vec(),
        decoder_hosts: vec!["127.0.0.1".to_string(); decode_ports.len()],
        decoder_ports: decode_ports.to_vec(),
        api_key: Some("sk-test".to_string()),
        ..Default::default()
    }
}
