//! Latchkey Store
//!
//! The contract between coordination primitives and the shared store they
//! coordinate through, plus an in-process implementation.
//!
//! # Model
//!
//! - Plain `get`/`set_with_expiry`/`delete` calls are individually atomic.
//! - Anything that reads before it writes is a [`Script`] executed through
//!   [`AtomicStore::atomic_execute`]; the store runs it with nothing
//!   interleaved.
//! - Scripts may publish on a channel; [`AtomicStore::wait_for_signal`]
//!   lets blocked callers wake up early instead of sleeping out a backoff.

pub mod codec;
pub mod error;
pub mod memory;
pub mod script;
pub mod store;

pub use codec::{decode_reply, decode_value, json_reply, read_json, write_json};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use script::{arg_at, key_at, KeyTtl, Reply, Script, ScriptContext};
pub use store::{AtomicStore, SharedStore};
