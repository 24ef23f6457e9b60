#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod allowlist;
mod resource_id;

pub use self::{allowlist::AddrSet, resource_id::ResourceId};

pub const CONTROLLER_NAME: &str = "ipshield.stakater.cloud/controller";
