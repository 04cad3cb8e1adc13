//! Intermediate payload format used to replay EEST blockchain fixtures.
//!
//! A [`PayloadFile`] holds one [`Payload`] per fixture test case. Transactions reference
//! participants through placeholders (`$sender[1]`, `$contract[2]`) that are bound to
//! concrete addresses only when the payload is executed against a network.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod error;
mod parse;
mod payload;
mod placeholder;
mod tx_type;

pub use error::*;
pub use parse::*;
pub use payload::*;
pub use placeholder::*;
pub use tx_type::*;
