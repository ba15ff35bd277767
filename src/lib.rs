//! Durable append-only stream store.
//!
//! A server-side storage engine for the durable streams protocol:
//! streams are created, appended to and read over HTTP semantics, with
//! every byte persisted to a crash-safe segment file before the append
//! is acknowledged.
//!
//! # Features
//!
//! - **Durable segments**: appends are length-prefix framed, written and
//!   fsynced to an append-only file per stream; recovery reconciles
//!   metadata to file truth and reclaims partial tails left by a crash
//! - **Idempotent producers**: Kafka-style `(producerId, epoch, seq)`
//!   validation gives exactly-once appends under pipelined retries, with
//!   epoch fencing for zombie instances
//! - **Replay**: read from any offset; offsets are lexicographically
//!   sortable position tokens
//! - **Live tailing**: long-poll waits ride a per-path wakeup bus instead
//!   of polling; SSE streams data and control frames
//! - **TTL/expiration**: relative or absolute expiry with a background
//!   sweeper
//! - **JSON mode**: `application/json` streams flatten top-level arrays
//!   one level into individual messages and render reads as an array
//! - **Writer coordination**: `Stream-Seq` values must strictly increase
//!
//! # Example
//!
//! ```rust,no_run
//! use silt::{server, types::ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ServerOptions {
//!         port: 4437,
//!         data_dir: "./silt-data".into(),
//!         ..Default::default()
//!     };
//!     server::start_server(options).await.unwrap();
//! }
//! ```
//!
//! Or drive the engine directly:
//!
//! ```rust,no_run
//! use silt::{StoreOptions, StreamStore, StreamConfig, AppendOptions, Offset};
//!
//! # fn main() -> Result<(), silt::StoreError> {
//! let store = StreamStore::open(StoreOptions::new("./silt-data"))?;
//! store.create("/events", StreamConfig {
//!     content_type: Some("application/json".into()),
//!     ..Default::default()
//! })?;
//! let result = store.append("/events", br#"{"hello":"world"}"#, AppendOptions::default())?;
//! let read = store.read("/events", Offset::ZERO)?;
//! assert_eq!(read.next_offset, result.offset);
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol
//!
//! ## Creating a stream
//!
//! ```text
//! PUT /stream/my-events HTTP/1.1
//! Content-Type: application/json
//! Stream-TTL: 3600
//!
//! Response: 201 Created
//! Stream-Next-Offset: 0000000000000000_0000000000000000
//! ```
//!
//! ## Appending data
//!
//! ```text
//! POST /stream/my-events HTTP/1.1
//! Content-Type: application/json
//! Producer-Id: writer-1
//! Producer-Epoch: 0
//! Producer-Seq: 0
//!
//! {"event": "user_created", "id": 123}
//!
//! Response: 200 OK
//! Stream-Next-Offset: 0000000000000000_0000000000000040
//! ```
//!
//! ## Reading data
//!
//! ```text
//! GET /stream/my-events?offset=-1 HTTP/1.1
//!
//! Response: 200 OK
//! Stream-Next-Offset: 0000000000000000_0000000000000040
//! Stream-Up-To-Date: true
//! Content-Type: application/json
//!
//! [{"event": "user_created", "id": 123}]
//! ```
//!
//! ## Long-polling
//!
//! ```text
//! GET /stream/my-events?offset=0000000000000000_0000000000000040&live=long-poll HTTP/1.1
//!
//! (waits up to 30 seconds for new data)
//!
//! Response: 204 No Content
//! Stream-Up-To-Date: true
//! ```
//!
//! ## Server-Sent Events
//!
//! ```text
//! GET /stream/my-events?offset=-1&live=sse HTTP/1.1
//! Accept: text/event-stream
//!
//! event: data
//! data: {"event": "user_created", "id": 123}
//!
//! event: control
//! data: {"streamNextOffset": "0000000000000000_0000000000000040", "upToDate": true}
//! ```

pub mod bus;
pub mod cursor;
pub mod error;
pub mod handle_pool;
pub mod meta;
pub mod path_encoding;
pub mod segment;
pub mod server;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use error::StoreError;
pub use server::{create_router, start_server, AppState};
pub use store::StreamStore;
pub use types::{
    AppendOptions, AppendResult, CloseResult, Offset, ProducerOutcome, ReadResult, ServerOptions,
    StoreOptions, StreamConfig, StreamMessage, StreamMetadata, WaitResult,
};
