#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use hostport_operator_core as core;
pub use hostport_operator_k8s_api as k8s;

mod admission;
mod args;
mod config;
mod metrics;

pub use self::args::Args;
