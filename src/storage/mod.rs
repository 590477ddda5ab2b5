pub mod csv_sink;

pub use csv_sink::CsvSink;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::extract::ProductRecord;

/// Append-only destination for normalized records
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&mut self, record: &ProductRecord) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
}

/// Drain the record channel into the sink. A single writer task keeps
/// concurrent producers from interleaving rows; it finishes when every
/// sender has been dropped. Returns the number of records written.
pub async fn run_sink(
    mut sink: Box<dyn RecordSink>,
    mut records: mpsc::Receiver<ProductRecord>,
) -> Result<usize> {
    let mut written = 0usize;

    while let Some(record) = records.recv().await {
        debug!("Writing record: {}", record.url);
        sink.write(&record).await?;
        written += 1;
    }

    sink.flush().await?;

    Ok(written)
}
