use tracing_subscriber::{filter::LevelFilter, prelude::*, util::SubscriberInitExt, EnvFilter};

/// Log to stderr, at `info` unless `RUST_LOG` says otherwise.
pub fn init() {
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::INFO.into())
                        .from_env_lossy(),
                ),
        )
        .init();
}
