use anyhow::{Result, Context};
use async_trait::async_trait;
use std::fs::{self, File};
use std::path::Path;
use tracing::debug;

use crate::extract::ProductRecord;
use crate::storage::RecordSink;

/// CSV sink with the fixed column order url, name, description, sku, image,
/// price_currency, price, availability. The header row comes from the record
/// field names, which match that order.
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    /// Create the output file, including any missing parent directories
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let writer = csv::Writer::from_path(path)
            .context(format!("Failed to create output file: {}", path.display()))?;

        debug!("Writing records to: {}", path.display());

        Ok(Self { writer })
    }
}

#[async_trait]
impl RecordSink for CsvSink {
    async fn write(&mut self, record: &ProductRecord) -> Result<()> {
        self.writer
            .serialize(record)
            .context(format!("Failed to write record for {}", record.url))
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush output file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record() -> ProductRecord {
        ProductRecord {
            url: "https://www.cyamoda.com/p/camisa-123.html".to_string(),
            name: "Camisa, con comas".to_string(),
            description: " Nice shirt  Cotton".to_string(),
            sku: "SKU-1".to_string(),
            image: r#"["https://img.example/1.jpg"]"#.to_string(),
            price_currency: "MXN".to_string(),
            price: 129.99,
            availability: "InStock".to_string(),
        }
    }

    #[tokio::test]
    async fn serialized_record_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("products.csv");

        let mut sink = CsvSink::create(&path).unwrap();
        sink.write(&record()).await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        let mut reader = csv::Reader::from_path(&path).unwrap();

        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                "url",
                "name",
                "description",
                "sku",
                "image",
                "price_currency",
                "price",
                "availability",
            ]
        );

        let parsed: ProductRecord = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(parsed, record());
    }
}
