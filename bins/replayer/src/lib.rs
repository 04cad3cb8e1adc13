//! Command line front end of the EEST fixture replayer.

pub mod cmd;
