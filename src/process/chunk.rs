// src/process/chunk.rs

use std::io::{self, BufRead};
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::batch::Batch;
use super::sink::Sink;
use crate::fetch::{self, SourceLocator};
use crate::log::{LogError, RetryPolicy};

/// How one record stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Input ran out; `dropped` tail records did not fill a batch.
    Exhausted { dropped: usize },
    /// The run-wide batch ceiling was hit. Nothing more should be read.
    CeilingReached,
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("reading records: {0}")]
    Read(#[from] io::Error),
    #[error("produce failed after {emitted} batches: {source}")]
    Produce {
        emitted: usize,
        #[source]
        source: LogError,
    },
}

/// Groups record lines into full batches and emits them to a sink. The
/// ceiling and the emitted count span every stream fed to one chunker.
#[derive(Debug)]
pub struct BatchChunker {
    sink: Sink,
    ceiling: Option<usize>,
    emitted: usize,
    delay: Duration,
}

impl BatchChunker {
    pub fn new(sink: Sink, ceiling: Option<usize>, delay: Duration) -> Self {
        Self {
            sink,
            ceiling,
            emitted: 0,
            delay,
        }
    }

    /// Batches emitted so far across all streams.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn ceiling_reached(&self) -> bool {
        self.ceiling.is_some_and(|c| self.emitted >= c)
    }

    /// Reads `reader` to the end (or to the ceiling), emitting a batch for
    /// every ten lines. Line endings (`\n` or `\r\n`) are stripped; record
    /// bytes are otherwise passed through untouched. Reading and decoding run
    /// on the blocking pool.
    pub async fn chunk<R>(&mut self, year: i32, reader: R) -> Result<StreamEnd, ChunkError>
    where
        R: BufRead + Send + 'static,
    {
        if self.ceiling_reached() {
            return Ok(StreamEnd::CeilingReached);
        }
        let (tx, mut lines) = mpsc::channel(LINE_BUFFER);
        tokio::task::spawn_blocking(move || split_lines(reader, tx));

        let mut batch = Batch::new(year);
        while let Some(line) = lines.recv().await {
            batch.records.push(line?);
            if !batch.is_full() {
                continue;
            }

            let payload = batch.to_wire();
            self.sink
                .emit(&payload)
                .await
                .map_err(|source| ChunkError::Produce {
                    emitted: self.emitted,
                    source,
                })?;
            self.emitted += 1;
            debug!(year, batches = self.emitted, "batch emitted");

            if self.ceiling_reached() {
                info!(batches = self.emitted, "batch ceiling reached; stopping");
                return Ok(StreamEnd::CeilingReached);
            }
            batch = Batch::new(year);
            if self.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.delay).await;
            }
        }

        let dropped = batch.records.len();
        if dropped > 0 {
            debug!(year, dropped, "dropping partial tail batch");
        }
        Ok(StreamEnd::Exhausted { dropped })
    }
}

/// Lines in flight between the reader thread and the chunker.
const LINE_BUFFER: usize = 1024;

/// Sends each line of `reader`, without its terminator, until the input
/// ends, a read fails or the receiver goes away.
fn split_lines<R: BufRead>(mut reader: R, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    loop {
        let mut buf = Vec::with_capacity(512);
        let line = match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Ok(buf)
            }
            Err(e) => Err(e),
        };
        let failed = line.is_err();
        if tx.blocking_send(line).is_err() || failed {
            return;
        }
    }
}

/// One year-tagged record stream to be chunked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub year: i32,
    pub locator: SourceLocator,
}

/// Totals for a multi-source read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub batches: usize,
    pub sources_read: usize,
    /// Sources that could not be fetched or read, with the reason.
    pub failed: Vec<(String, String)>,
    pub ceiling_reached: bool,
}

/// Chunks every source in order. A source that cannot be fetched or read is
/// logged and skipped; a produce failure aborts the whole run.
#[instrument(level = "info", skip_all, fields(sources = sources.len()))]
pub async fn read_and_chunk(
    client: &Client,
    sources: &[Source],
    chunker: &mut BatchChunker,
    retry: RetryPolicy,
) -> Result<ChunkReport, ChunkError> {
    let mut report = ChunkReport::default();
    for source in sources {
        if chunker.ceiling_reached() {
            report.ceiling_reached = true;
            break;
        }
        info!(
            source = %source.locator,
            year = source.year,
            batches = chunker.emitted(),
            "processing source"
        );
        let payload = match fetch::load(client, &source.locator, retry).await {
            Ok(p) => p,
            Err(e) => {
                warn!(source = %source.locator, error = %e, "skipping source");
                report.failed.push((source.locator.to_string(), e.to_string()));
                continue;
            }
        };
        match chunker.chunk(source.year, fetch::decode(payload)).await {
            Ok(end) => {
                report.sources_read += 1;
                if end == StreamEnd::CeilingReached {
                    report.ceiling_reached = true;
                    break;
                }
            }
            Err(ChunkError::Read(e)) => {
                warn!(
                    source = %source.locator,
                    error = %e,
                    "source unreadable; skipping remainder"
                );
                report.failed.push((source.locator.to_string(), e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }
    report.batches = chunker.emitted();
    Ok(report)
}
