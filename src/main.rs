use clap::Parser;
use disagg_proxy::config::{DEFAULT_MAX_PAYLOAD_SIZE, ProxyConfig};
use disagg_proxy::server;
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Prefill/decode disaggregation proxy", long_about = None)]
struct Args {
    #[arg(long, default_value = "localhost", help = "Host address to bind the proxy to")]
    host: String,

    #[arg(long, default_value_t = 8000, help = "Port number to listen on")]
    port: u16,

    #[arg(
        long = "prefiller-hosts",
        alias = "prefiller-host",
        num_args = 1..,
        default_value = "localhost",
        help = "Hosts of the prefill instances"
    )]
    prefiller_hosts: Vec<String>,

    #[arg(
        long = "prefiller-ports",
        alias = "prefiller-port",
        num_args = 1..,
        default_value = "8100",
        help = "Ports of the prefill instances, one per host"
    )]
    prefiller_ports: Vec<u16>,

    #[arg(
        long = "decoder-hosts",
        alias = "decoder-host",
        num_args = 1..,
        default_value = "localhost",
        help = "Hosts of the decode instances"
    )]
    decoder_hosts: Vec<String>,

    #[arg(
        long = "decoder-ports",
        alias = "decoder-port",
        num_args = 1..,
        default_value = "8200",
        help = "Ports of the decode instances, one per host"
    )]
    decoder_ports: Vec<u16>,

    #[arg(
        long,
        env = "OPENAI_API_KEY",
        hide_env_values = true,
        help = "Bearer token forwarded to every backend"
    )]
    api_key: Option<String>,

    #[arg(
        long,
        help = "Timeout in seconds for each backend request, including the full decode stream. Unset means no timeout"
    )]
    timeout_secs: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_SIZE, help = "Maximum request body size in bytes")]
    max_payload_size: usize,

    #[arg(long, default_value = "info", help = "Log level: off, error, warn, info, debug or trace")]
    log_level: LevelFilter,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            host: self.host,
            port: self.port,
            prefiller_hosts: self.prefiller_hosts,
            prefiller_ports: self.prefiller_ports,
            decoder_hosts: self.decoder_hosts,
            decoder_ports: self.decoder_ports,
            api_key: self.api_key,
            timeout_secs: self.timeout_secs,
            max_payload_size: self.max_payload_size,
            log_level: self.log_level,
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config();
    config.validate()?;
    server::startup(config).await
}
