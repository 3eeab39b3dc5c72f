//! The master process's interception layer: everything that makes the
//! aggregated address space transparent to an unmodified user program.
//! Built as a `cdylib` so its exported symbols (see [`interception`])
//! shadow the corresponding libc entry points when loaded ahead of the
//! user program; the `rlib` half is what the `dsm-master` binary links
//! against to run its own startup sequence.

pub mod error;
pub mod fault_service;
pub mod heap_intercept;
pub mod heartbeat;
pub mod interception;
pub mod region_alloc;
pub mod signal;
pub mod startup;
