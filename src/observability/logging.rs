use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Installs a reasonable default `tracing` subscriber: `warn` everywhere
/// except this crate and `rmcp`, which log at `debug`. Callers embedding
/// the engine in a larger process should install their own subscriber
/// instead and skip this.
pub fn init_default_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .parse("flujo_engine=debug,rmcp=info")
        .unwrap();

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE);

    Registry::default().with(filter).with(fmt_layer).init();
}
