//! Podlift Library
//!
//! Builds a container image, ships it to plain servers over SSH and swaps
//! traffic to the new version without downtime.

pub mod config;
pub mod deploy;
pub mod docker;
pub mod errors;
pub mod filesys;
pub mod git;
pub mod logs;
pub mod proxy;
pub mod remote;
pub mod utils;
