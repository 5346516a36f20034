//! Offramp core
//!
//! Bridges request handlers running on a cooperative async scheduler to
//! heavy, blocking computations on dedicated worker threads. A submission
//! is routed to a worker that exclusively owns one callable instance; the
//! submitting task suspends on a Bridge (single result) or a StreamChannel
//! (ordered chunk sequence) without consuming a thread, and overload,
//! cancellation, and failure are all handled at the request boundary.

pub mod bridge;
pub mod callable;
pub mod dispatch;
pub mod request;
pub mod stream;
pub mod supervisor;
pub mod worker;

pub use bridge::{Bridge, BridgeResolver, BridgeWaiter};
pub use callable::{CallOutcome, Callable, ChunkIter, ChunkPayload};
pub use dispatch::{Dispatcher, InferHandle};
pub use request::{InferRequest, RequestId};
pub use stream::{Chunk, StreamChannel, StreamConsumer, StreamProducer};
pub use supervisor::Supervisor;
pub use worker::{Responder, WorkerHandle, WorkerJob};
