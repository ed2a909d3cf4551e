//! `cairn-kernel` – Coordination & Guard Rails
//!
//! The part of Cairn that decides *whether* and *where* something may happen;
//! it never stores or ranks anything itself.
//!
//! # Modules
//!
//! - [`path_resolver`] – [`PathResolver`][path_resolver::PathResolver]:
//!   normalises caller paths into validated segments under the namespace
//!   prefix, and [`PathIndex`][path_resolver::PathIndex], the flat
//!   parent → children index the memory tree is built on.
//! - [`lock_manager`] – [`LockManager`][lock_manager::LockManager]:
//!   advisory per-path exclusive locks with TTL-based recovery of abandoned
//!   holders.
//! - [`call_gate`] – [`CallGate`][call_gate::CallGate]:
//!   the single interception point every tool call passes before dispatch.
//!   Runs an ordered list of [`CallRule`][call_gate::CallRule]s (known tool,
//!   required parameters, secret content).

pub mod call_gate;
pub mod lock_manager;
pub mod path_resolver;

pub use call_gate::{CallGate, CallRule, KnownToolRule, ParamType, RequiredParamsRule, SecretContentRule};
pub use lock_manager::{LockGuard, LockInfo, LockManager, LockToken};
pub use path_resolver::{PathIndex, PathResolver, ResolvedPath};
