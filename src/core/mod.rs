//! Multiplexer core: registry, join driver, rotation and facade.
//!
//! The public API from this module is [`Multiplexer`] (with [`MultiplexerBuilder`] and
//! [`Config`]), the [`Subscription`] disposer and the [`ChannelState`] snapshot.
//!
//! Internal modules:
//! - [`entry`]: per-topic state, ref count, handlers and the shared join future;
//! - [`registry`]: topic table, join driver, signal pump and teardown;
//! - [`rotation`]: token rotation and sign-out across all registries;
//! - [`subscription`]: the disposer handed to callers;
//! - [`multiplexer`]: facade and session wiring;
//! - [`builder`]: assembles a multiplexer from a transport and a config.

mod builder;
mod config;
mod entry;
mod multiplexer;
mod registry;
mod rotation;
mod subscription;

pub use builder::MultiplexerBuilder;
pub use config::Config;
pub use entry::ChannelState;
pub use multiplexer::Multiplexer;
pub use subscription::Subscription;
