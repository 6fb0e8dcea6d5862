use crate::errors::DatasetError;
use crate::model::{ColumnType, InlineRow, TableDef, Value};
use chrono::{NaiveDate, NaiveDateTime, Timelike};

/// Coerces authored fixture rows into the table's declared column types.
pub fn coerce_rows(table: &TableDef, rows: &[InlineRow]) -> Result<Vec<Vec<Value>>, DatasetError> {
    let width = table.columns.len();
    let mut out = Vec::with_capacity(rows.len());

    for (idx, row) in rows.iter().enumerate() {
        let raw: Vec<Value> = match row {
            InlineRow::Positional(values) => {
                if values.len() != width {
                    return Err(DatasetError::SchemaMismatch {
                        table: table.name.clone(),
                        column: "*".into(),
                        reason: format!("row {} has {} values, expected {}", idx, values.len(), width),
                    });
                }
                values.clone()
            }
            InlineRow::Named(map) => {
                for key in map.keys() {
                    if !table.columns.iter().any(|c| c.name.eq_ignore_ascii_case(key)) {
                        return Err(DatasetError::SchemaMismatch {
                            table: table.name.clone(),
                            column: key.clone(),
                            reason: format!("row {} sets an undeclared column", idx),
                        });
                    }
                }
                table
                    .columns
                    .iter()
                    .map(|c| {
                        map.iter()
                            .find(|(k, _)| k.eq_ignore_ascii_case(&c.name))
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            }
        };

        let mut coerced = Vec::with_capacity(width);
        for (col, v) in table.columns.iter().zip(raw) {
            let value = coerce_value(v, col.ty).map_err(|reason| DatasetError::SchemaMismatch {
                table: table.name.clone(),
                column: col.name.clone(),
                reason: format!("row {}: {}", idx, reason),
            })?;
            coerced.push(value);
        }
        out.push(coerced);
    }

    Ok(out)
}

pub fn coerce_value(v: Value, ty: ColumnType) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let bad = |v: &Value| format!("cannot store {} as {}", describe(v), ty.as_str());

    match ty {
        ColumnType::Integer => match v {
            Value::Int(_) => Ok(v),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Value::Int(f as i64)),
            Value::Text(ref s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| bad(&v)),
            _ => Err(bad(&v)),
        },
        ColumnType::Float => match v {
            Value::Float(_) => Ok(v),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::Text(ref s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| bad(&v)),
            _ => Err(bad(&v)),
        },
        ColumnType::Text => Ok(match v {
            Value::Text(_) => v,
            Value::Int(i) => Value::Text(i.to_string()),
            Value::Float(f) => Value::Text(f.to_string()),
            Value::Bool(b) => Value::Text(b.to_string()),
            Value::Null => Value::Null,
        }),
        ColumnType::Boolean => match v {
            Value::Bool(_) => Ok(v),
            Value::Int(0) => Ok(Value::Bool(false)),
            Value::Int(1) => Ok(Value::Bool(true)),
            Value::Text(ref s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(bad(&v)),
            },
            _ => Err(bad(&v)),
        },
        ColumnType::Date => match v {
            Value::Text(ref s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .map_err(|_| bad(&v)),
            _ => Err(bad(&v)),
        },
        ColumnType::Timestamp => match v {
            Value::Text(ref s) => parse_timestamp(s)
                .map(|ts| Value::Text(format_timestamp(&ts)))
                .ok_or_else(|| bad(&v)),
            _ => Err(bad(&v)),
        },
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Canonical timestamp text: `YYYY-MM-DD HH:MM:SS`, with milliseconds only when non-zero.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    if ts.nanosecond() == 0 {
        ts.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }
}

fn describe(v: &Value) -> String {
    match v {
        Value::Null => "null".into(),
        Value::Bool(_) => "a boolean".into(),
        Value::Int(_) => "an integer".into(),
        Value::Float(_) => "a float".into(),
        Value::Text(_) => "a string".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDef, TableSource};
    use std::collections::BTreeMap;

    fn orders() -> TableDef {
        TableDef {
            name: "orders".into(),
            columns: vec![
                ColumnDef::new("id", ColumnType::Integer),
                ColumnDef::new("amount", ColumnType::Float),
                ColumnDef::new("placed_at", ColumnType::Timestamp),
            ],
            source: TableSource::Inline { rows: vec![] },
        }
    }

    #[test]
    fn test_positional_and_named_rows() {
        let mut named = BTreeMap::new();
        named.insert("ID".to_string(), Value::Text("2".into()));
        named.insert("amount".to_string(), Value::Int(20));
        let rows = vec![
            InlineRow::Positional(vec![
                Value::Int(1),
                Value::Float(10.0),
                Value::Text("2024-03-01T10:00:00Z".into()),
            ]),
            InlineRow::Named(named),
        ];
        let out = coerce_rows(&orders(), &rows).unwrap();
        assert_eq!(
            out[0],
            vec![
                Value::Int(1),
                Value::Float(10.0),
                Value::Text("2024-03-01 10:00:00".into())
            ]
        );
        assert_eq!(out[1], vec![Value::Int(2), Value::Float(20.0), Value::Null]);
    }

    #[test]
    fn test_bad_cell_names_table_and_column() {
        let rows = vec![InlineRow::Positional(vec![
            Value::Text("abc".into()),
            Value::Float(1.0),
            Value::Null,
        ])];
        match coerce_rows(&orders(), &rows).unwrap_err() {
            DatasetError::SchemaMismatch { table, column, .. } => {
                assert_eq!(table, "orders");
                assert_eq!(column, "id");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_key_and_wrong_arity() {
        let mut named = BTreeMap::new();
        named.insert("discount".to_string(), Value::Int(1));
        assert!(coerce_rows(&orders(), &[InlineRow::Named(named)]).is_err());
        assert!(coerce_rows(&orders(), &[InlineRow::Positional(vec![Value::Int(1)])]).is_err());
    }

    #[test]
    fn test_scalar_coercions() {
        assert_eq!(coerce_value(Value::Float(3.0), ColumnType::Integer), Ok(Value::Int(3)));
        assert!(coerce_value(Value::Float(3.5), ColumnType::Integer).is_err());
        assert_eq!(coerce_value(Value::Text("yes".into()), ColumnType::Boolean), Ok(Value::Bool(true)));
        assert_eq!(coerce_value(Value::Int(7), ColumnType::Text), Ok(Value::Text("7".into())));
        assert!(coerce_value(Value::Text("2024-13-01".into()), ColumnType::Date).is_err());
        assert_eq!(
            coerce_value(Value::Text("2024-01-02 03:04:05.250".into()), ColumnType::Timestamp),
            Ok(Value::Text("2024-01-02 03:04:05.250".into()))
        );
    }
}
