// src/lib.rs
//! Census records chunked through a partitioned log, classified, and
//! tallied per year behind an HTTP query endpoint.

pub mod commands;
pub mod config;
pub mod fetch;
pub mod log;
pub mod process;
pub mod results;

#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kafka_scale=debug")),
        )
        .with_test_writer()
        .finish();
    // already set by another test
    let _ = tracing::subscriber::set_global_default(subscriber);
}
