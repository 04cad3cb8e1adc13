//! Conversion of EEST blockchain test fixtures into replay payloads.
//!
//! Fixture pre-state accounts with code become contracts deployed by a dedicated deployer
//! wallet, plain accounts become sender wallets, and every address they are known under is
//! rewritten into a `$contract[N]` / `$sender[N]` placeholder so the payload can be replayed
//! with fresh wallets on any network.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod converter;
mod error;
pub mod fixture;
mod mapper;

pub use converter::*;
pub use error::ConvertError;
pub use mapper::AddressMapper;
