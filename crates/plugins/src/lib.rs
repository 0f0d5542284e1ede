//! Plugin system: the capability interface, the ordered plugin chain, the
//! compiled-in provider registry and the reference `timeseries` provider.
//!
//! Providers are looked up by name from the `[[plugins]]` config array at
//! startup. A provider that is unknown, fails to construct or fails the
//! probe is skipped with a warning; the rest still load.

pub mod api;
pub mod chain;
pub mod registry;
pub mod timeseries;
pub mod window;

pub use {
    api::{Capability, ListLookup, ListRequest},
    chain::{PluginChain, PluginError},
    registry::ProviderRegistry,
};
