//! Replays EEST payloads against live execution clients.
//!
//! Each [`payload::Payload`] is executed as an isolated unit: a disjoint set of wallets is
//! locked from the [`WalletLockPool`], placeholders are bound by the [`AddressMap`], the
//! [`PayloadExecutor`] submits the deployer phase and then every sender group, and the
//! [`PostCheckValidator`] compares the resulting chain state with the fixture
//! expectations. The [`ReplayRunner`] drives many executions concurrently and aggregates
//! their outcomes in [`ReplayStats`].
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod address;
mod client;
mod config;
mod controller;
mod driver;
mod executor;
mod loader;
mod lock;
mod materialize;
#[cfg(test)]
mod mock;
mod pool;
mod postcheck;
mod stats;
mod supervisor;
mod txpool;
mod wallet;

pub use address::*;
pub use client::*;
pub use config::*;
pub use controller::*;
pub use driver::*;
pub use executor::*;
pub use loader::*;
pub use lock::*;
pub use materialize::*;
pub use pool::*;
pub use postcheck::*;
pub use stats::*;
pub use supervisor::*;
pub use txpool::*;
pub use wallet::*;
