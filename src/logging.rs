use std::io::Write;

use log::LevelFilter;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global logger. `RUST_LOG` overrides `level`.
///
/// Later calls are no-ops, so tests and embedders may call this freely.
pub fn init_logging(level: LevelFilter) {
    let result = env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                chrono::Local::now().format(TIMESTAMP_FORMAT),
                record.target(),
                record.level(),
                record.args()
            )
        })
        .filter(None, level)
        .parse_default_env()
        .try_init();
    if result.is_err() {
        log::debug!("Logger already initialized");
    }
}
