//! Parquet encoding of snapshot batches.
//!
//! A snapshot is small (a few thousand stations), so each one becomes a
//! single in-memory Parquet file with one row group.

use bytes::Bytes;
use deltalake::arrow::array::RecordBatch;
use deltalake::parquet::arrow::ArrowWriter;
use deltalake::parquet::basic::Compression;
use deltalake::parquet::file::properties::WriterProperties;
use snafu::prelude::*;
use std::time::Instant;
use tracing::trace;

use crate::error::{ParquetWriteSnafu, WarehouseError};

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Encode a batch as a complete Parquet file.
pub fn encode_batch(batch: &RecordBatch) -> Result<Bytes, WarehouseError> {
    let start = Instant::now();
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), Some(writer_properties()))
        .context(ParquetWriteSnafu)?;
    writer.write(batch).context(ParquetWriteSnafu)?;
    let buffer = writer.into_inner().context(ParquetWriteSnafu)?;

    trace!(
        rows = batch.num_rows(),
        bytes = buffer.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Encoded parquet file"
    );
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedKind;
    use crate::snapshot::SnapshotTimestamp;
    use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    #[test]
    fn test_encoded_file_reads_back() {
        let rows = FeedKind::Status
            .parse_snapshot(
                SnapshotTimestamp::parse_stamp("20240115_140000").unwrap(),
                br#"{"data": {"stations": [{"station_id": "a"}, {"station_id": "b"}]}}"#,
                &chrono_tz::UTC,
            )
            .unwrap();

        let bytes = encode_batch(&rows.batch).unwrap();
        assert_eq!(&bytes[..4], b"PAR1");

        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .unwrap()
            .build()
            .unwrap();
        let total: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_empty_batch_is_valid_file() {
        let rows = FeedKind::Info
            .parse_snapshot(
                SnapshotTimestamp::parse_stamp("20240115_140000").unwrap(),
                br#"{"data": {"stations": []}}"#,
                &chrono_tz::UTC,
            )
            .unwrap();
        let bytes = encode_batch(&rows.batch).unwrap();
        assert!(bytes.len() > 8);
    }
}
