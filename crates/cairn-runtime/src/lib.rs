//! `cairn-runtime` – the Cairn core as a reasoning loop sees it.
//!
//! # Modules
//!
//! - [`dispatcher`] – [`Dispatcher`][dispatcher::Dispatcher]: owns the tool
//!   catalog, the memory tree, the result cache and the call gate, and turns
//!   every [`ToolCall`][cairn_types::ToolCall] into one
//!   [`Observation`][cairn_types::Observation].
//! - [`observation`] – [`ObservationFormatter`][observation::ObservationFormatter]
//!   builds the envelopes; [`render_block`][observation::render_block] lays a
//!   batch out in the marker-delimited transcript format.
//! - [`retry_guard`] – [`RepeatQueryGuard`][retry_guard::RepeatQueryGuard]:
//!   detects a session re-issuing the same fruitless discovery query and
//!   switches the reply to "change terminology or give up".
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter.
//!
//! # Call gating
//!
//! Every call passes the [`CallGate`] before it is routed.  The gate is
//! re-exported so embedders can extend it without a direct dependency on
//! `cairn-kernel`.

pub mod dispatcher;
pub mod observation;
pub mod retry_guard;
pub mod telemetry;

pub use dispatcher::{CoreConfig, CoreStatus, Dispatcher, SERVED_TOOLS};
pub use observation::{MatchedTool, ObservationFormatter, render_block};
pub use retry_guard::RepeatQueryGuard;
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

pub use cairn_kernel::{CallGate, CallRule};
