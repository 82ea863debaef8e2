//! Logging and tracing bootstrap for the Cadence orchestrator.
//!
//! Installs an `EnvFilter` driven fmt subscriber, optionally exporting spans
//! over OTLP, and provides span constructors for builds, recipes and
//! dispatches.

pub mod spans;
pub mod tracer;

pub use spans::{CiAttributes, build_span, dispatch_span, recipe_span};
pub use tracer::{
    LogFormat, OtlpConfig, TracerError, TracingConfig, init_tracer, shutdown_tracer,
};
