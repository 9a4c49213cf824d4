//! The query/event engine (spec §4.D): turns a packet stream into
//! branch-query answers and an event queue, tracking the running IP,
//! execution mode, TSX state, paging, and CPU-errata workarounds along
//! the way.
//!
//! Built on [`pt_packet`]'s packet codec, generalizing `iptr-decoder`'s
//! push-style `HandlePacket` callback into the pull-style
//! `cond_branch`/`indirect_branch`/`event` surface spec §4.D names.

mod config;
mod decoder;
mod event;
mod exec_mode;
mod ip;
mod queue;
mod tnt_cache;

pub use pt_error::{ErrorKind, PtResult, StatusFlags};

pub use config::{Config, Cpu, CpuVendor, Errata, determine_errata};
pub use decoder::QueryDecoder;
pub use event::{Binding, Event, EventKind};
pub use exec_mode::ExecMode;
pub use ip::{IpQuery, LastIp};
pub use queue::EventQueues;
pub use tnt_cache::TntCache;
