//! Gateways exposing an Aerospike record store under familiar surfaces: a
//! RESP frontend that maps Redis-style commands onto record operations and
//! server-side UDFs, plus the store plumbing its HTTP sibling shares.

pub mod commands;
pub mod proto;
pub mod server;
pub mod store;
