#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod engine;
pub mod ledger;
pub mod queue;
pub mod store;

#[cfg(test)]
mod tests;

pub use self::{
    engine::{Fanout, Reconcile, Reconciler},
    ledger::Ledger,
    queue::{QueueHandle, WorkQueue},
    store::{KubeStore, Patch, Store, StoreError},
};
