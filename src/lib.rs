//! Admission - per-principal message throttling
//!
//! This crate implements the admission-control layer of a cluster
//! coordinator. Messages from registered entities are counted, gated through
//! a leaky bucket shared by every entity declaring the same principal, and
//! either forwarded in order or rejected when the bucket is at capacity.

pub mod admission;
pub mod config;
pub mod error;
