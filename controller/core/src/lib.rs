#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config_entry;
mod error;
pub mod matching;
pub mod meta;
pub mod peering;
pub mod resource;
pub mod tenancy;

pub use self::{
    config_entry::{ConfigEntry, ConfigEntryService, NamespaceSpec},
    error::RemoteError,
    peering::{Peering, PeeringService},
    resource::{Resource, ResourceId, ResourceService, ResourceType, Tenancy},
    tenancy::TenancyConfig,
};
