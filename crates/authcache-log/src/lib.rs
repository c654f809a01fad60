use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

const FILE_PREFIX: &str = "authcache.log";

/// Installs the global subscriber. Console output goes to stderr so stdout stays free for
/// command output. `RUST_LOG` wins over the default level; calling this twice is a no-op.
pub fn init(diagnostics: bool) {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter(diagnostics));
    let registry = tracing_subscriber::registry().with(console);

    match std::env::var("AUTHCACHE_LOG_DIR").ok().filter(|d| !d.trim().is_empty()) {
        Some(dir) if std::fs::create_dir_all(&dir).is_err() => {
            // Rolling appenders panic on an unusable directory; keep console logging only.
            let _ = registry.try_init();
            tracing::warn!(directory = %dir, "failed to create log directory; file logging disabled");
        }
        Some(dir) => {
            let rotation = std::env::var("AUTHCACHE_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
            let writer = match Rotation::parse(&rotation) {
                Rotation::Hourly => tracing_appender::rolling::hourly(&dir, FILE_PREFIX),
                Rotation::Minutely => tracing_appender::rolling::minutely(&dir, FILE_PREFIX),
                Rotation::Daily => tracing_appender::rolling::daily(&dir, FILE_PREFIX),
            };
            let (nb, guard) = tracing_appender::non_blocking(writer);
            let _ = FILE_GUARD.set(guard);
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(nb)
                .with_filter(env_filter(diagnostics));
            let _ = registry.with(file_layer).try_init();
        }
        None => {
            let _ = registry.try_init();
        }
    }
}

fn default_directive(diagnostics: bool) -> &'static str {
    if diagnostics {
        "debug"
    } else {
        "info"
    }
}

fn env_filter(diagnostics: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(diagnostics)))
}

#[derive(Debug, PartialEq, Eq)]
enum Rotation {
    Daily,
    Hourly,
    Minutely,
}

impl Rotation {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }
}
