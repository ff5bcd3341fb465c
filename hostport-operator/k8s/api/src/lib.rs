#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod pod;

pub use self::pod::PodLister;
pub use k8s_openapi::api::core::v1::{Pod, PodSpec};
pub use kube::{Resource, ResourceExt};
