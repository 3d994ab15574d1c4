// src/process/mod.rs
//! Batching, field extraction and the stage loop shared by the consumers.

pub mod batch;
pub mod chunk;
pub mod schema;
pub mod sink;
pub mod stage;
pub mod transform;

pub use batch::{Batch, ParseError, BATCH_SIZE};
pub use chunk::{read_and_chunk, BatchChunker, ChunkError, ChunkReport, Source, StreamEnd};
pub use schema::{FixedWidthField, HEHOUSUT};
pub use sink::Sink;
pub use stage::{StageHandler, StageOutcome, StageRunner, StageState};
pub use transform::{transform, TransformStage};
