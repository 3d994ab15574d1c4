use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::batch::{Batch, ParseError};
use super::schema::{FixedWidthField, HEHOUSUT};
use super::sink::Sink;
use super::stage::StageHandler;
use crate::log::{LogError, LogMessage};
use crate::results::ResultRecord;

/// Reduces a batch to the ordered list of codes found in `field`. Records
/// that are too short or hold a non-numeric field contribute nothing.
pub fn classify_batch(batch: &Batch, field: &FixedWidthField) -> ResultRecord {
    let codes = batch
        .records
        .iter()
        .filter_map(|r| {
            let code = field.decode_int(r);
            if code.is_none() {
                trace!(
                    field = field.name,
                    record = %String::from_utf8_lossy(r),
                    "no code in record"
                );
            }
            code
        })
        .collect();
    ResultRecord {
        year: batch.year,
        codes,
    }
}

/// Compute-topic batch in, `year:codes` wire record out.
pub fn transform(payload: &[u8]) -> Result<ResultRecord, ParseError> {
    Batch::parse(payload).map(|b| classify_batch(&b, &HEHOUSUT))
}

/// Stage handler turning batches from the compute topic into result records.
pub struct TransformStage {
    sink: Sink,
    delay: Duration,
    field: FixedWidthField,
}

impl TransformStage {
    pub fn new(sink: Sink, delay: Duration) -> Self {
        Self {
            sink,
            delay,
            field: HEHOUSUT,
        }
    }
}

#[async_trait]
impl StageHandler for TransformStage {
    async fn handle(&mut self, msg: &LogMessage) -> Result<(), LogError> {
        let batch = match Batch::parse(&msg.payload) {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, offset = msg.offset, "discarding malformed batch");
                return Ok(());
            }
        };
        let record = classify_batch(&batch, &self.field);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let wire = record.to_wire();
        debug!(message = %wire, "transformed batch");
        self.sink.emit(wire.as_bytes()).await
    }
}
