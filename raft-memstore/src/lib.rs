//! An in-memory [`Storage`] implementation plus a loopback [`Network`],
//! used by `raft-core`'s own integration tests and by embedders exercising
//! a cluster without real disks or sockets.
//!
//! Register these with an [`Engine`](raft_core::Engine)'s
//! [`Registry`](raft_core::engine::Registry) under the `"memory"` and
//! `"loopback"` keys:
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register_storage("memory", |_cfg| Ok(Arc::new(MemStorage::new())));
//! let hub = LoopbackHub::new();
//! registry.register_network("loopback", move |_cfg| Ok(Arc::new(hub.clone())));
//! ```

mod network;
mod storage;

pub use network::LoopbackChannel;
pub use network::LoopbackHub;
pub use storage::MemStorage;
