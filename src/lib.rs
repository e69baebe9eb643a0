// #![warn(missing_docs)]

//! Rust implementation of the EPICS pvAccess protocol core.
//!
//! This crate is a pure-rust implementation of the [pvAccess protocol]'s
//! dynamic typed-value subsystem and client operation layer. It does not
//! depend on the C++ [pvxs] or epics-base projects at all.
//!
//! pvAccess moves self-describing, nested structured values: every request,
//! reply and subscription event is such a value. The crate is organised
//! around that split:
//! - [`typedesc`]: immutable type descriptors ([`TypeDef`], [`TypeCode`])
//! - [`value`]: mutable/immutable value trees ([`MValue`], [`IValue`])
//!   with per-field change marks
//! - [`wire`]: the compact wire codec with per-connection type caches
//! - [`messages`]: TCP framing and session setup
//! - [`client`]: channels and the get / put / introspect / monitor
//!   operation state machines
//!
//! UDP name search and the server side are out of scope here; the client
//! resolves channel names against a configured server address list.
//!
//! [pvAccess protocol]:
//!     https://docs.epics-controls.org/en/latest/pv-access/protocol.html
//! [pvxs]: https://github.com/epics-base/pvxs

pub mod client;
pub mod error;
pub mod messages;
pub mod nt;
pub mod pvrequest;
pub mod sharedarray;
pub mod typedesc;
mod utils;
pub mod value;
pub mod wire;

pub use client::{Config, Context, Operation, Subscription};
pub use error::Error;
pub use sharedarray::{ArrayType, SharedArray};
pub use typedesc::{Kind, Member, TypeCode, TypeDef};
pub use utils::{get_default_addr_list, get_default_server_port};
pub use value::{IValue, MValue, StoreType};
