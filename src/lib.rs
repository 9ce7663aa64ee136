//! Publish a cluster's spare capacity as an Advertisement into a peer
//! cluster, keep it fresh, and retract it on exit.

pub mod advertisement;
pub mod broadcaster;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod remote;
pub mod server;
