//! Spindle core
//!
//! This crate provides the balancing machinery of the Spindle reverse-proxy
//! load balancer: the backend pool, the selection policies and the data
//! structures they are built on. The HTTP front-end, configuration and
//! health monitoring live in `spindle-server`; this crate only decides
//! *which* upstream a request goes to and hands out the reverse-proxy
//! handle that forwards it.
//!
//! # Architecture
//!
//! - [`Backend`] owns a single upstream: its URL, an atomic status word
//!   holding the `ALIVE` and `READY` bits, and a lazily-constructed
//!   [`ReverseProxy`] handle that is cached after first use.
//! - [`SelectionPolicy`] is the tagged union of the two balancing
//!   algorithms. [`RoundRobin`] rotates an atomic cursor over a backend
//!   vector; [`LeastConnections`] keeps backends in an addressable
//!   min-heap ordered by in-flight request count.
//! - [`AddressablePq`] is the keyed binary heap behind least-connections:
//!   O(log n) push/pop/remove/emplace by key, with a key→index map kept in
//!   sync with the heap array.
//! - [`Backoff`] is the exponentially-growing sleep used by round-robin
//!   when a full pass over the pool finds no ready backend.
//! - [`Checker`] is the periodic background task the health monitor runs
//!   its probe callback on.
//!
//! # Concurrency
//!
//! Policy state is guarded by short, I/O-free `parking_lot` critical
//! sections; no lock is ever held across an await point. Backend status
//! bits are plain atomics, so health checks and request dispatch never
//! contend on a lock.

pub mod backend;
pub mod backoff;
pub mod checker;
pub mod error;
pub mod policy;
pub mod pqueue;
pub mod proxy;

pub use backend::Backend;
pub use backoff::Backoff;
pub use checker::Checker;
pub use error::{Error, Result};
pub use policy::{LeastConnections, RoundRobin, Selected, SelectionPolicy};
pub use pqueue::AddressablePq;
pub use proxy::ReverseProxy;
