use tracing_subscriber::{fmt, filter::EnvFilter};
use crate::config::Config;
use crate::error::Result;

/// Initialize global logging based on env or config.
/// Order: HYPERKERNEL_LOG env -> cfg.log_level -> "info"
pub fn init_telemetry(cfg: &Config) -> Result<()> {
    let filter = match std::env::var("HYPERKERNEL_LOG").ok() {
        Some(s) => EnvFilter::try_new(s),
        None => EnvFilter::try_new(&cfg.log_level),
    }.unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init();

    tracing::info!("telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn init_smoke() {
        let cfg = Config { log_level: "debug".into(), ..Config::default() };
        init_telemetry(&cfg).unwrap();
        init_telemetry(&cfg).unwrap(); // second install is a no-op
        tracing::debug!("debug after init");
    }
}
