//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! `session` orchestrates the other services. `presence` owns rooms and the
//! connection index, `coalescer` owns debounced saves, `hub` owns outbound
//! delivery, and `document` is the storage port.

pub mod coalescer;
pub mod document;
pub mod hub;
pub mod presence;
pub mod session;
