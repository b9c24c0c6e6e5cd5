//! Reliable-datagram messaging and one-sided RMA over an OFI/libfabric-shaped
//! fabric provider.
//!
//! [`class::NaClass`] is the crate's entry point: it opens a [`domain::Domain`]
//! and [`endpoint::Endpoint`] for a chosen [`provider::ProviderKind`], then
//! exposes context creation, address lookup, tagged send/recv, RMA put/get,
//! and the completion-queue [`class::NaClass::progress`]/cancel calls a host
//! RPC framework drives. See `DESIGN.md` for how each module is grounded.

pub mod addr;
pub mod callback;
pub mod class;
pub mod config;
pub mod context;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod header;
pub mod memh;
pub mod mempool;
pub mod msg;
pub mod op;
pub mod progress;
pub mod provider;
pub mod rma;

pub use callback::{CallbackQueue, Callback, CompletionEntry, CompletionPayload, CompletionResult, CompletionSink};
pub use class::NaClass;
pub use config::{Config, ProgressMode};
pub use error::{NaError, NaResult};
pub use op::OpId;
pub use provider::{FabricProvider, ProviderKind};
