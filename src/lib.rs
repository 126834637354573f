//! h2-completion: single-shot completion callbacks for HTTP/2 I/O
//!
//! This crate provides the completion primitive that asynchronous HTTP
//! producers and consumers hand to each other, plus two collaborators built
//! on it: a deferred request body whose chunks are acknowledged through a
//! callback, and a sans-I/O HTTP/2 WINDOW_UPDATE codec.
//!
//! # Features
//!
//! - **Three-signal callbacks**: `succeeded`, `failed(cause)` and a
//!   cooperative `abort(cause)` that folds into the next completion
//! - **Exactly-once hooks**: `on_aborted`, `on_succeeded`, `on_failed`,
//!   `on_completed`, safe under concurrent and re-entrant signals
//! - **Suppressed causes**: late failures stay reachable from the delivered one
//! - **Combinators**: `combine`, `Nested` and closure adapters
//! - **Deferred content**: offer byte ranges, block on `flush` until the
//!   transport has acknowledged them
//! - **WINDOW_UPDATE codec**: resumable parser that accepts input split at
//!   any byte boundary
//!
//! # Quick Start
//!
//! ```rust
//! use bytes::Bytes;
//! use h2_completion::{Callback, DeferredContent};
//!
//! let content = DeferredContent::new();
//! let cursor = content.cursor();
//!
//! content.offer(Bytes::from_static(b"hello"));
//! content.close();
//!
//! // transport side
//! while cursor.has_next() {
//!     if let Some(chunk) = cursor.next().unwrap() {
//!         assert_eq!(&chunk[..], b"hello");
//!         cursor.succeeded();
//!     }
//! }
//!
//! // nothing left unacknowledged
//! content.flush().unwrap();
//! ```
//!
//! # Architecture
//!
//! It does NOT provide:
//! - TCP/TLS transport (you provide the bytes)
//! - A full HTTP/2 implementation (HEADERS, HPACK, stream state)
//! - Future/promise chaining

pub mod callback;
pub mod cause;
pub mod deferred;
pub mod error;
pub mod h2_codec;

pub use callback::{
    combine, AbstractCallback, Blocker, Callback, CallbackHooks, Combined, Nested, Noop, NOOP,
};
pub use cause::Cause;
pub use deferred::{ContentListener, Cursor, DeferredConfig, DeferredContent};
pub use error::{Error, Result};
pub use h2_codec::{
    create_window_update, error_code, frame_type, write_window_update, FrameListener,
    H2FrameHeader, H2FrameParser, ParserConfig, WindowUpdateFrame, DEFAULT_MAX_FRAME_SIZE,
    FRAME_HEADER_LENGTH, MAX_WINDOW_DELTA, WINDOW_UPDATE_LENGTH,
};
