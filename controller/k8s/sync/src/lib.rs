#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Reconciles custom resources against Consul.
//!
//! Each reconcile reads the Kubernetes object through a [`Store`], compares
//! it with Consul's copy, and converges Consul toward it. The outcome is
//! recorded in the object's `Synced` condition.

mod entry;
mod error;
mod peering;
mod resource;
pub mod retry;
mod status;
mod store;


pub use self::{
    entry::{reconcile_entry, EntryContext},
    error::Error,
    peering::{reconcile_acceptor, reconcile_dialer},
    resource::reconcile_resource,
    store::{KubeStore, Store},
};

/// What the caller should do once a reconcile completes without error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Try again later, e.g. once a Consul namespace exists.
    Requeue,
}
