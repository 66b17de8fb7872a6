//! The embedded in-memory storage engine, the default backend.
//!
//! One process-wide store: per-table row maps plus ordered secondary-index
//! sets, guarded by a single engine lock that makes every commit a CAS-style
//! atomic step, and a broadcast channel carrying keyspace notifications. The
//! key naming (`{instance}:{Component}:{CLU{n}}:...`) matches what a
//! clustering engine would use, so the rest of the kernel is engine-agnostic.

mod client;
mod keeper;
mod maint;
mod mq;

pub use client::MemBackend;
