//! C FFI bindings for [`moq_client`].
//!
//! Provides a C-compatible API for real-time pub/sub over QUIC, consumed by
//! engine integrations (the `moq_ffi.h` header is generated at build time).
//!
//! ## Concepts
//!
//! - **Client**: One connection to a MoQ relay, with a state callback.
//! - **Publisher**: Sends binary or text messages to one (namespace, track).
//! - **Subscriber**: Receives every message published to one (namespace, track).
//!
//! ## Error Handling
//!
//! Fallible functions return a [MoqResult]: code 0 (`MOQ_OK`) on success, a
//! negative `MOQ_ERROR_*` code plus a heap-allocated message otherwise. The
//! message must be released with [moq_free_str]. Handle constructors return
//! null on failure. Panics never cross the boundary; they become
//! `MOQ_ERROR_PANIC`.
//!
//! ## Threading
//!
//! The library runs its own tokio runtime on a dedicated thread. Callbacks
//! are invoked from library-owned tasks, never from the caller's thread;
//! marshal to your own main thread if needed.

mod api;
mod error;
mod ffi;

pub use api::*;
pub use error::*;
