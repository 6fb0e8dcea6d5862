//! Turns a problem's table definitions into loadable tables.

pub mod cache;
pub mod inline;
pub mod parquet;

pub use cache::{DatasetCache, DecodedObject, ObjectKey};

use crate::errors::DatasetError;
use crate::model::{ColumnDef, ColumnType, ObjectRef, ResultSet, TableDef, TableSource, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Rows for one table: owned (inline fixtures) or a projection over a cached object.
#[derive(Debug, Clone)]
pub enum TableData {
    Owned(Vec<Vec<Value>>),
    Shared {
        object: Arc<DecodedObject>,
        projection: Vec<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct ResolvedTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub data: TableData,
}

impl ResolvedTable {
    /// Rows in the source, including rows above the decode ceiling that were never decoded.
    pub fn source_rows(&self) -> u64 {
        match &self.data {
            TableData::Owned(rows) => rows.len() as u64,
            TableData::Shared { object, .. } => object.total_rows,
        }
    }

    pub fn rows(&self) -> Box<dyn Iterator<Item = Vec<&Value>> + '_> {
        match &self.data {
            TableData::Owned(rows) => Box::new(rows.iter().map(|r| r.iter().collect())),
            TableData::Shared { object, projection } => Box::new(
                object
                    .rows
                    .iter()
                    .map(move |r| projection.iter().map(|&i| &r[i]).collect()),
            ),
        }
    }

    pub fn byte_estimate(&self) -> u64 {
        self.rows()
            .map(|r| r.iter().map(|v| v.byte_estimate()).sum::<u64>())
            .sum()
    }
}

/// Ground truth loaded from a reference-solution object.
#[derive(Debug, Clone)]
pub enum ReferenceSolution {
    Query(String),
    Output(ResultSet),
}

/// Whether data of type `actual` can be loaded into a column declared as `declared`.
pub fn compatible(declared: ColumnType, actual: ColumnType) -> bool {
    declared == actual
        || declared == ColumnType::Text
        || matches!(
            (declared, actual),
            (ColumnType::Float, ColumnType::Integer)
                | (ColumnType::Timestamp, ColumnType::Date)
                | (ColumnType::Date, ColumnType::Text)
                | (ColumnType::Timestamp, ColumnType::Text)
        )
}

/// Maps declared columns onto the object's columns; infers the schema when none are declared.
pub fn project(table: &TableDef, object: Arc<DecodedObject>) -> Result<ResolvedTable, DatasetError> {
    if !object.is_complete() {
        return Err(DatasetError::TooLarge {
            table: table.name.clone(),
            reason: format!(
                "{} rows, only {} decoded (above the per-object decode ceiling)",
                object.total_rows,
                object.rows.len()
            ),
        });
    }

    let mut seen = HashSet::new();
    for c in &object.columns {
        if !seen.insert(c.name.to_ascii_lowercase()) {
            return Err(DatasetError::DuplicateColumn {
                table: table.name.clone(),
                column: c.name.clone(),
            });
        }
    }

    if table.columns.is_empty() {
        let projection = (0..object.columns.len()).collect();
        return Ok(ResolvedTable {
            name: table.name.clone(),
            columns: object.columns.clone(),
            data: TableData::Shared { object, projection },
        });
    }

    let mut projection = Vec::with_capacity(table.columns.len());
    for declared in &table.columns {
        let Some(idx) = object
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(&declared.name))
        else {
            return Err(DatasetError::SchemaMismatch {
                table: table.name.clone(),
                column: declared.name.clone(),
                reason: "declared column is missing from the dataset".into(),
            });
        };
        let actual = object.columns[idx].ty;
        if !compatible(declared.ty, actual) {
            return Err(DatasetError::SchemaMismatch {
                table: table.name.clone(),
                column: declared.name.clone(),
                reason: format!(
                    "declared {}, dataset has {}",
                    declared.ty.as_str(),
                    actual.as_str()
                ),
            });
        }
        projection.push(idx);
    }

    Ok(ResolvedTable {
        name: table.name.clone(),
        columns: table.columns.clone(),
        data: TableData::Shared { object, projection },
    })
}

/// Resolves every table of a problem, or none: one failing table fails the whole set.
pub struct Resolver {
    cache: Arc<DatasetCache>,
}

impl Resolver {
    pub fn new(cache: Arc<DatasetCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<DatasetCache> {
        &self.cache
    }

    pub async fn resolve(
        &self,
        tables: &[TableDef],
        fetch_timeout: Duration,
    ) -> Result<Vec<ResolvedTable>, DatasetError> {
        let mut names = HashSet::new();
        for t in tables {
            if !names.insert(t.name.to_ascii_lowercase()) {
                return Err(DatasetError::DuplicateTable {
                    table: t.name.clone(),
                });
            }
            let mut cols = HashSet::new();
            for c in &t.columns {
                if !cols.insert(c.name.to_ascii_lowercase()) {
                    return Err(DatasetError::DuplicateColumn {
                        table: t.name.clone(),
                        column: c.name.clone(),
                    });
                }
            }
        }

        let remote = tables.iter().filter_map(|t| match &t.source {
            TableSource::Remote(r) => Some(async move {
                let object = self.cache.get_or_fetch(r, &t.name).await?;
                Ok::<_, DatasetError>((t.name.clone(), object))
            }),
            TableSource::Inline { .. } => None,
        });
        let fetched = tokio::time::timeout(fetch_timeout, futures::future::try_join_all(remote))
            .await
            .map_err(|_| DatasetError::FetchTimeout {
                timeout_ms: fetch_timeout.as_millis() as u64,
            })??;
        let mut fetched: std::collections::HashMap<String, Arc<DecodedObject>> =
            fetched.into_iter().collect();

        let mut out = Vec::with_capacity(tables.len());
        for t in tables {
            let resolved = match &t.source {
                TableSource::Inline { rows } => ResolvedTable {
                    name: t.name.clone(),
                    columns: t.columns.clone(),
                    data: TableData::Owned(inline::coerce_rows(t, rows)?),
                },
                TableSource::Remote(_) => {
                    let object = fetched.remove(&t.name).ok_or_else(|| DatasetError::NotFound {
                        table: t.name.clone(),
                    })?;
                    project(t, object)?
                }
            };
            out.push(resolved);
        }
        Ok(out)
    }

    /// Loads a reference solution: a `.sql` key is a query, anything else a Parquet output.
    pub async fn load_reference(
        &self,
        r: &ObjectRef,
        fetch_timeout: Duration,
        max_rows: u64,
    ) -> Result<ReferenceSolution, DatasetError> {
        let fut = async {
            if r.is_sql() {
                self.cache
                    .fetch_text(r, 1024 * 1024)
                    .await
                    .map(ReferenceSolution::Query)
            } else {
                self.cache
                    .fetch_result_set(r, max_rows)
                    .await
                    .map(ReferenceSolution::Output)
            }
        };
        tokio::time::timeout(fetch_timeout, fut)
            .await
            .map_err(|_| DatasetError::FetchTimeout {
                timeout_ms: fetch_timeout.as_millis() as u64,
            })?
    }
}
