//! Parquet decoding through the row-record API.
//!
//! Full decodes read a local temp file. Validation never materializes the
//! object: it fetches the footer and the first non-empty row group's column
//! chunks and serves them to the reader from a sparse in-memory image.

use crate::dataset::inline::format_timestamp;
use crate::model::{ColumnDef, ColumnType, ResultSet, Value};
use bytes::{Buf, Bytes};
use parquet::basic::{ConvertedType, LogicalType, Type as PhysicalType};
use parquet::errors::ParquetError;
use parquet::file::reader::{ChunkReader, FileReader, Length, SerializedFileReader};
use parquet::record::{Field, Row};
use parquet::schema::types::Type;

pub const FOOTER_LEN: u64 = 8;
const MAGIC: &[u8; 4] = b"PAR1";

/// Fully or partially decoded contents of one Parquet object.
#[derive(Debug, Clone)]
pub struct ParquetContents {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
    /// Row count from the footer, which may exceed `rows.len()`.
    pub total_rows: u64,
}

pub fn map_type(field: &Type) -> Option<ColumnType> {
    if !field.is_primitive() {
        return None;
    }
    let info = field.get_basic_info();
    let logical = info.logical_type();
    let converted = info.converted_type();

    let ty = match field.get_physical_type() {
        PhysicalType::BOOLEAN => ColumnType::Boolean,
        PhysicalType::INT32 | PhysicalType::INT64 => match (logical, converted) {
            (Some(LogicalType::Date), _) | (_, ConvertedType::DATE) => ColumnType::Date,
            (Some(LogicalType::Timestamp { .. }), _)
            | (_, ConvertedType::TIMESTAMP_MILLIS)
            | (_, ConvertedType::TIMESTAMP_MICROS) => ColumnType::Timestamp,
            (Some(LogicalType::Decimal { .. }), _) | (_, ConvertedType::DECIMAL) => {
                ColumnType::Float
            }
            _ => ColumnType::Integer,
        },
        PhysicalType::INT96 => ColumnType::Timestamp,
        PhysicalType::FLOAT | PhysicalType::DOUBLE => ColumnType::Float,
        PhysicalType::BYTE_ARRAY | PhysicalType::FIXED_LEN_BYTE_ARRAY => {
            match (logical, converted) {
                (Some(LogicalType::Decimal { .. }), _) | (_, ConvertedType::DECIMAL) => {
                    ColumnType::Float
                }
                _ => ColumnType::Text,
            }
        }
    };
    Some(ty)
}

/// Top-level columns in file order. Nested groups are rejected.
pub fn schema_of<R: ChunkReader + 'static>(
    reader: &SerializedFileReader<R>,
) -> Result<Vec<ColumnDef>, String> {
    let root = reader.metadata().file_metadata().schema();
    let mut cols = Vec::new();
    for field in root.get_fields() {
        let ty = map_type(field)
            .ok_or_else(|| format!("column '{}' is a nested type", field.name()))?;
        cols.push(ColumnDef::new(field.name(), ty));
    }
    Ok(cols)
}

pub fn field_to_value(field: &Field) -> Value {
    match field {
        Field::Null => Value::Null,
        Field::Bool(b) => Value::Bool(*b),
        Field::Byte(v) => Value::Int(i64::from(*v)),
        Field::Short(v) => Value::Int(i64::from(*v)),
        Field::Int(v) => Value::Int(i64::from(*v)),
        Field::Long(v) => Value::Int(*v),
        Field::UByte(v) => Value::Int(i64::from(*v)),
        Field::UShort(v) => Value::Int(i64::from(*v)),
        Field::UInt(v) => Value::Int(i64::from(*v)),
        Field::ULong(v) => i64::try_from(*v)
            .map(Value::Int)
            .unwrap_or(Value::Float(*v as f64)),
        Field::Float(v) => Value::Float(f64::from(*v)),
        Field::Double(v) => Value::Float(*v),
        Field::Str(s) => Value::Text(s.clone()),
        Field::Bytes(b) => match std::str::from_utf8(b.data()) {
            Ok(s) => Value::Text(s.to_string()),
            Err(_) => Value::Text(hex::encode(b.data())),
        },
        Field::Date(days) => chrono::NaiveDate::from_num_days_from_ce_opt(719_163 + *days)
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        Field::TimestampMillis(ms) => chrono::DateTime::from_timestamp_millis(*ms)
            .map(|t| Value::Text(format_timestamp(&t.naive_utc())))
            .unwrap_or(Value::Null),
        Field::TimestampMicros(us) => chrono::DateTime::from_timestamp_micros(*us)
            .map(|t| Value::Text(format_timestamp(&t.naive_utc())))
            .unwrap_or(Value::Null),
        Field::Decimal(_) => {
            let text = field.to_string();
            text.parse::<f64>().map(Value::Float).unwrap_or(Value::Text(text))
        }
        other => Value::Text(other.to_string()),
    }
}

fn row_values(row: &Row) -> Vec<Value> {
    row.get_column_iter().map(|(_, f)| field_to_value(f)).collect()
}

/// Decodes up to `max_rows` rows. When the footer reports more rows than
/// that, nothing is decoded and only the count is returned.
pub fn decode<R: ChunkReader + 'static>(
    reader: SerializedFileReader<R>,
    max_rows: u64,
) -> Result<ParquetContents, String> {
    let columns = schema_of(&reader)?;
    let total_rows = reader.metadata().file_metadata().num_rows().max(0) as u64;
    if total_rows > max_rows {
        return Ok(ParquetContents {
            columns,
            rows: Vec::new(),
            total_rows,
        });
    }

    let mut rows = Vec::with_capacity(total_rows as usize);
    let iter = reader.get_row_iter(None).map_err(|e| e.to_string())?;
    for row in iter {
        let row = row.map_err(|e| e.to_string())?;
        rows.push(row_values(&row));
    }
    Ok(ParquetContents {
        columns,
        rows,
        total_rows,
    })
}

pub fn decode_file(file: std::fs::File, max_rows: u64) -> Result<ParquetContents, String> {
    let reader = SerializedFileReader::new(file).map_err(|e| e.to_string())?;
    decode(reader, max_rows)
}

pub fn decode_result_set(file: std::fs::File, max_rows: u64) -> Result<ResultSet, String> {
    let contents = decode_file(file, max_rows)?;
    if contents.total_rows > max_rows {
        return Err(format!(
            "expected output has {} rows, more than the {} allowed",
            contents.total_rows, max_rows
        ));
    }
    Ok(ResultSet::new(
        contents.columns.into_iter().map(|c| c.name).collect(),
        contents.rows,
    ))
}

/// Length of the metadata block encoded in the 8-byte footer.
pub fn metadata_len(footer: &[u8]) -> Result<u64, String> {
    if footer.len() < FOOTER_LEN as usize {
        return Err("file is smaller than a parquet footer".into());
    }
    let tail = &footer[footer.len() - FOOTER_LEN as usize..];
    if &tail[4..] != MAGIC {
        return Err("not a parquet file (missing footer magic)".into());
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&tail[..4]);
    Ok(u64::from(u32::from_le_bytes(len)))
}

/// A partial image of a remote file: only the fetched byte ranges are readable.
#[derive(Debug, Clone, Default)]
pub struct SparseObject {
    len: u64,
    segments: Vec<(u64, Bytes)>,
}

impl SparseObject {
    pub fn new(len: u64) -> Self {
        Self {
            len,
            segments: Vec::new(),
        }
    }

    pub fn insert(&mut self, start: u64, data: Bytes) {
        self.segments.push((start, data));
    }

    pub fn covers(&self, start: u64, len: u64) -> bool {
        self.segment(start, len).is_some()
    }

    pub fn fetched_bytes(&self) -> u64 {
        self.segments.iter().map(|(_, b)| b.len() as u64).sum()
    }

    fn segment(&self, start: u64, len: u64) -> Option<Bytes> {
        self.segments.iter().find_map(|(s, b)| {
            let end = *s + b.len() as u64;
            if start >= *s && start + len <= end {
                Some(b.slice((start - s) as usize..))
            } else {
                None
            }
        })
    }
}

impl Length for SparseObject {
    fn len(&self) -> u64 {
        self.len
    }
}

impl ChunkReader for SparseObject {
    type T = bytes::buf::Reader<Bytes>;

    fn get_read(&self, start: u64) -> parquet::errors::Result<Self::T> {
        self.segment(start, 0)
            .map(|b| b.reader())
            .ok_or_else(|| ParquetError::General(format!("byte {} was not fetched", start)))
    }

    fn get_bytes(&self, start: u64, length: usize) -> parquet::errors::Result<Bytes> {
        self.segment(start, length as u64)
            .map(|b| b.slice(..length))
            .ok_or_else(|| {
                ParquetError::General(format!("bytes {}..{} were not fetched", start, start + length as u64))
            })
    }
}

/// Byte ranges of every column chunk in the first row group that has rows.
pub fn first_row_group_ranges<R: ChunkReader + 'static>(
    reader: &SerializedFileReader<R>,
) -> Option<(usize, Vec<(u64, u64)>)> {
    let meta = reader.metadata();
    meta.row_groups()
        .iter()
        .position(|rg| rg.num_rows() > 0)
        .map(|idx| {
            let ranges = meta.row_group(idx).columns().iter().map(|c| c.byte_range()).collect();
            (idx, ranges)
        })
}

/// Reads at most `limit` rows from one row group.
pub fn sample_row_group<R: ChunkReader + 'static>(
    reader: &SerializedFileReader<R>,
    row_group: usize,
    limit: usize,
) -> Result<Vec<Vec<Value>>, String> {
    let rg = reader.get_row_group(row_group).map_err(|e| e.to_string())?;
    let iter = rg.get_row_iter(None).map_err(|e| e.to_string())?;
    let mut rows = Vec::new();
    for row in iter.take(limit) {
        let row = row.map_err(|e| e.to_string())?;
        rows.push(row_values(&row));
    }
    Ok(rows)
}


#[cfg(test)]
mod tests {
    use super::testutil::orders_parquet;
    use super::*;

    #[test]
    fn test_decode_schema_and_rows() {
        let bytes = Bytes::from(orders_parquet(&[vec![(1, 10.0, "a"), (2, 20.0, "b")]]));
        let reader = SerializedFileReader::new(bytes).unwrap();
        let contents = decode(reader, 100).unwrap();
        assert_eq!(
            contents.columns,
            vec![
                ColumnDef::new("id", ColumnType::Integer),
                ColumnDef::new("amount", ColumnType::Float),
                ColumnDef::new("name", ColumnType::Text),
            ]
        );
        assert_eq!(contents.total_rows, 2);
        assert_eq!(
            contents.rows[1],
            vec![Value::Int(2), Value::Float(20.0), Value::Text("b".into())]
        );
    }

    #[test]
    fn test_decode_ceiling_skips_rows() {
        let bytes = Bytes::from(orders_parquet(&[vec![(1, 1.0, "a"), (2, 2.0, "b"), (3, 3.0, "c")]]));
        let reader = SerializedFileReader::new(bytes).unwrap();
        let contents = decode(reader, 2).unwrap();
        assert_eq!(contents.total_rows, 3);
        assert!(contents.rows.is_empty());
    }

    #[test]
    fn test_sparse_reader_serves_footer_and_first_group() {
        let raw = orders_parquet(&[vec![(1, 1.0, "x")], vec![(2, 2.0, "y")]]);
        let len = raw.len() as u64;
        let full = Bytes::from(raw);

        let meta_len = metadata_len(&full[..]).unwrap();
        let tail_start = len - FOOTER_LEN - meta_len;
        let mut sparse = SparseObject::new(len);
        sparse.insert(tail_start, full.slice(tail_start as usize..));

        let reader = SerializedFileReader::new(sparse.clone()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
        let (rg, ranges) = first_row_group_ranges(&reader).unwrap();
        assert_eq!(rg, 0);
        for (start, n) in ranges {
            sparse.insert(start, full.slice(start as usize..(start + n) as usize));
        }

        let reader = SerializedFileReader::new(sparse.clone()).unwrap();
        let rows = sample_row_group(&reader, 0, 10).unwrap();
        assert_eq!(rows, vec![vec![Value::Int(1), Value::Float(1.0), Value::Text("x".into())]]);
        assert!(sparse.fetched_bytes() < len);
    }

    #[test]
    fn test_metadata_len_rejects_non_parquet() {
        assert!(metadata_len(b"hello world!").is_err());
        assert!(metadata_len(b"PAR").is_err());
    }
}
