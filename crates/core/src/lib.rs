//! Core library for the Guarder XDP filter control plane: rule codec and
//! catalogue, telemetry digests, AI rule synthesis, and metrics.

pub mod codec;
pub mod digest;
pub mod ebpf;
pub mod error;
pub mod metrics;
pub mod rule;
pub mod store;
pub mod synth;
pub mod telemetry;
