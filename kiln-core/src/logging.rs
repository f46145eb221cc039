use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global fmt subscriber. `RUST_LOG` takes precedence over `default_level`.
///
/// Calling it again after a subscriber is set is a no-op.
pub fn init_tracing(default_level: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{default_level},hyper=warn,h2=warn").into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();

    // another thread may have won the race, which is fine
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
