mod logging;

pub use logging::init_default_tracing;
