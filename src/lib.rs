//! # Passive serialization and passive references
//!
//! Synchronization for shared state that is read on hot paths and changed
//! rarely:
//!
//! - **Passive serialization** (`PserializeDomain`, `Participant`): readers
//!   open short, non-blocking read sections that cost one store and a fence;
//!   a writer calls `synchronize()` to wait until every section that could
//!   have seen an unlinked object has ended.
//! - **Passive references** (`PsrefClass`, `PsrefTarget`, `Psref`): a
//!   per-object count that keeps one object alive across blocking work.
//!   `PsrefTarget::destroy` waits for the count to drain.
//! - **Variant swapping** (`VariantRoot`, `VariantRef`): one published pointer
//!   to an immutable configuration. Readers pin the variant they observed; a
//!   writer republishes and gets the old value back once its readers are gone.
//! - **Reader/writer semaphore** (`RwSemaphore`): sleepable many-readers /
//!   one-writer exclusion with writer FIFO and no writer starvation.
//! - **Tunnel** (`Tunnel`): a point-to-point interface whose endpoints are a
//!   swapped variant, the way network drivers consume the pieces above.
//!
//! ## Typical Usage
//!
//! ```rust
//! use psz_sync::{PserializeDomain, PsrefClass, VariantRoot};
//! use std::sync::Arc;
//! use std::thread;
//!
//! // 1. One domain per process, one class per kind of object
//! let domain = PserializeDomain::new();
//! let class = PsrefClass::new("route");
//! let root = Arc::new(VariantRoot::new(&domain, &class, 1u32));
//!
//! // 2. Readers register a participant and pin the current variant
//! let reader = {
//!     let (domain, root) = (domain.clone(), root.clone());
//!     thread::spawn(move || {
//!         let participant = domain.register_participant();
//!         let value = root.get(&participant).unwrap();
//!         assert!(*value == 1 || *value == 2);
//!     })
//! };
//!
//! // 3. The writer publishes a new variant and reclaims the old one
//! let old = root.replace(2);
//! assert_eq!(old, Some(1));
//!
//! reader.join().unwrap();
//! ```
//!
//! ## Misuse
//!
//! Misuse is a bug, not an error: releasing what was never acquired, a
//! recursive write lock or blocking inside a read section panics (the last
//! one in debug builds). Contention is never reported as an error; it is
//! resolved by blocking or, for a retiring psref target, by retrying.

mod sync;

mod domain;
mod psref;
mod reader;
mod rwsem;
mod state;
mod tunnel;
mod variant;

#[cfg(test)]
mod tests;

pub use domain::{PserializeDomain, PserializeDomainBuilder};
pub use psref::{Psref, PsrefClass, PsrefTarget, Retired};
pub use reader::{in_read_section, Participant, ReadSection};
pub use rwsem::{RwSemReadGuard, RwSemWriteGuard, RwSemaphore};
pub use tunnel::{Encapsulate, Inet4Encap, Inet6Encap, Tunnel, TunnelConfig, TunnelError};
pub use variant::{VariantRef, VariantRoot};
