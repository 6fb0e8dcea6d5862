//! Result-set equivalence. Pure functions of the two inputs and the policy.

use crate::model::{ComparisonPolicy, ResultSet, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Why two result sets were judged different. Never carries expected cell values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Columns {
        unexpected: Vec<String>,
        missing: usize,
    },
    RowCount {
        candidate: usize,
        expected: usize,
    },
    Row {
        index: usize,
        sorted: bool,
    },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::Columns {
                unexpected,
                missing,
            } => {
                write!(f, "result columns do not match the expected columns")?;
                if !unexpected.is_empty() {
                    write!(f, "; unexpected: {}", unexpected.join(", "))?;
                }
                if *missing > 0 {
                    write!(f, "; {} expected column(s) missing", missing)?;
                }
                Ok(())
            }
            Mismatch::RowCount {
                candidate,
                expected,
            } => write!(f, "expected {} row(s), got {}", expected, candidate),
            Mismatch::Row { index, sorted } => {
                if *sorted {
                    write!(f, "row {} differs (rows compared in sorted order)", index + 1)
                } else {
                    write!(f, "row {} differs", index + 1)
                }
            }
        }
    }
}

pub fn compare(candidate: &ResultSet, expected: &ResultSet, policy: &ComparisonPolicy) -> bool {
    compare_detailed(candidate, expected, policy).is_ok()
}

pub fn compare_detailed(
    candidate: &ResultSet,
    expected: &ResultSet,
    policy: &ComparisonPolicy,
) -> Result<(), Mismatch> {
    let mapping = reconcile_columns(&candidate.columns, &expected.columns)?;

    if candidate.rows.len() != expected.rows.len() {
        return Err(Mismatch::RowCount {
            candidate: candidate.rows.len(),
            expected: expected.rows.len(),
        });
    }

    // Candidate rows re-ordered into expected column order.
    let cand: Vec<Vec<&Value>> = candidate
        .rows
        .iter()
        .map(|r| mapping.iter().map(|&i| r.get(i).unwrap_or(&Value::Null)).collect())
        .collect();
    let exp: Vec<Vec<&Value>> = expected
        .rows
        .iter()
        .map(|r| {
            (0..expected.columns.len())
                .map(|i| r.get(i).unwrap_or(&Value::Null))
                .collect()
        })
        .collect();

    if policy.row_order_sensitive {
        for (index, (c, e)) in cand.iter().zip(exp.iter()).enumerate() {
            if !rows_equal(c, e, policy) {
                return Err(Mismatch::Row {
                    index,
                    sorted: false,
                });
            }
        }
        return Ok(());
    }

    match_unordered(&cand, &exp, policy).map_err(|index| Mismatch::Row {
        index,
        sorted: true,
    })
}

fn rows_equal(a: &[&Value], b: &[&Value], policy: &ComparisonPolicy) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| cells_equal(x, y, policy))
}

/// Part of a row's bucket key. Cells that can only ever equal one exact
/// value (NULL, non-numeric text) key exactly; everything that compares
/// with tolerance or across types is a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CellKey {
    Null,
    Text(String),
    Loose,
}

fn cell_key(v: &Value, case_insensitive: bool) -> CellKey {
    match v {
        Value::Null => CellKey::Null,
        Value::Text(s)
            if numeric(v).is_none()
                && !s.eq_ignore_ascii_case("true")
                && !s.eq_ignore_ascii_case("false") =>
        {
            if case_insensitive {
                CellKey::Text(s.to_ascii_lowercase())
            } else {
                CellKey::Text(s.clone())
            }
        }
        _ => CellKey::Loose,
    }
}

/// Multiset equality under `cells_equal`. Tolerant equality is not
/// transitive, so rows are paired by bipartite matching inside buckets of
/// exactly-keyed cells. On failure returns the position, in canonical
/// order, of the first expected row left without a partner.
fn match_unordered(
    cand: &[Vec<&Value>],
    exp: &[Vec<&Value>],
    policy: &ComparisonPolicy,
) -> Result<(), usize> {
    let ci = !policy.case_sensitive_strings;
    let mut cand_order: Vec<usize> = (0..cand.len()).collect();
    let mut exp_order: Vec<usize> = (0..exp.len()).collect();
    cand_order.sort_by(|&a, &b| cmp_rows(&cand[a], &cand[b], ci));
    exp_order.sort_by(|&a, &b| cmp_rows(&exp[a], &exp[b], ci));

    if cand_order
        .iter()
        .zip(exp_order.iter())
        .all(|(&c, &e)| rows_equal(&cand[c], &exp[e], policy))
    {
        return Ok(());
    }

    let mut rank = vec![0; exp.len()];
    for (pos, &e) in exp_order.iter().enumerate() {
        rank[e] = pos;
    }

    // Buckets keep canonical order because the orders above are walked in turn.
    let mut buckets: HashMap<Vec<CellKey>, (Vec<usize>, Vec<usize>)> = HashMap::new();
    for &c in &cand_order {
        let key = cand[c].iter().map(|v| cell_key(v, ci)).collect();
        buckets.entry(key).or_default().0.push(c);
    }
    for &e in &exp_order {
        let key = exp[e].iter().map(|v| cell_key(v, ci)).collect();
        buckets.entry(key).or_default().1.push(e);
    }

    let mut first_unmatched: Option<usize> = None;
    for (cb, eb) in buckets.values() {
        let edge = |e: usize, c: usize| rows_equal(&cand[cb[c]], &exp[eb[e]], policy);
        let matched = max_matching(eb.len(), cb.len(), edge);
        for (e, m) in matched.iter().enumerate() {
            if m.is_none() {
                let r = rank[eb[e]];
                first_unmatched = Some(first_unmatched.map_or(r, |f| f.min(r)));
            }
        }
    }
    match first_unmatched {
        Some(r) => Err(r),
        None => Ok(()),
    }
}

/// Maximum bipartite matching (augmenting paths) between `left` expected
/// rows and `right` candidate rows, both given in canonical order. Seeded
/// with the positional pairing, which already covers most rows.
fn max_matching(left: usize, right: usize, edge: impl Fn(usize, usize) -> bool) -> Vec<Option<usize>> {
    let mut match_left: Vec<Option<usize>> = vec![None; left];
    let mut match_right: Vec<Option<usize>> = vec![None; right];
    for i in 0..left.min(right) {
        if edge(i, i) {
            match_left[i] = Some(i);
            match_right[i] = Some(i);
        }
    }

    let mut visited = vec![false; right];
    let mut via = vec![0usize; right];
    for root in 0..left {
        if match_left[root].is_some() {
            continue;
        }
        visited.iter_mut().for_each(|v| *v = false);

        // Iterative DFS; a frame is (left node, next right node to try).
        let mut stack = vec![(root, 0usize)];
        let mut free = None;
        while let Some(top) = stack.last_mut() {
            let (l, r) = *top;
            if r >= right {
                stack.pop();
                continue;
            }
            top.1 += 1;
            if visited[r] || !edge(l, r) {
                continue;
            }
            visited[r] = true;
            via[r] = l;
            match match_right[r] {
                None => {
                    free = Some(r);
                    break;
                }
                Some(next) => stack.push((next, 0)),
            }
        }

        // Flip the path back to the root.
        let mut cur = free;
        while let Some(r) = cur {
            let l = via[r];
            let prev = match_left[l];
            match_left[l] = Some(r);
            match_right[r] = Some(l);
            cur = prev;
        }
    }
    match_left
}

/// For each expected column, the index of the candidate column with the same
/// (case-insensitive) name. Repeated names pair up in order of appearance.
fn reconcile_columns(candidate: &[String], expected: &[String]) -> Result<Vec<usize>, Mismatch> {
    let mut used = vec![false; candidate.len()];
    let mut mapping = Vec::with_capacity(expected.len());
    let mut missing = 0;

    for name in expected {
        let found = candidate
            .iter()
            .enumerate()
            .position(|(i, c)| !used[i] && c.eq_ignore_ascii_case(name));
        match found {
            Some(i) => {
                used[i] = true;
                mapping.push(i);
            }
            None => missing += 1,
        }
    }

    let unexpected: Vec<String> = candidate
        .iter()
        .zip(used.iter())
        .filter(|(_, u)| !**u)
        .map(|(c, _)| c.clone())
        .collect();

    if missing > 0 || !unexpected.is_empty() {
        return Err(Mismatch::Columns {
            unexpected,
            missing,
        });
    }
    Ok(mapping)
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn numeric(v: &Value) -> Option<Num> {
    match v {
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(f) => Some(Num::Float(*f)),
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        Value::Text(s) => {
            let t = s.trim();
            if t.is_empty() {
                return None;
            }
            t.parse::<i64>()
                .map(Num::Int)
                .ok()
                .or_else(|| t.parse::<f64>().ok().filter(|f| f.is_finite()).map(Num::Float))
        }
        Value::Null => None,
    }
}

fn numbers_equal(a: Num, b: Num, tol: f64) -> bool {
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        return x == y;
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    if x.is_nan() || y.is_nan() {
        return x.is_nan() && y.is_nan();
    }
    if x == y {
        return true;
    }
    let diff = (x - y).abs();
    diff <= tol || diff <= tol * x.abs().max(y.abs())
}

fn text_of(v: &Value) -> Option<&str> {
    match v {
        Value::Text(s) => Some(s.as_str()),
        Value::Bool(true) => Some("true"),
        Value::Bool(false) => Some("false"),
        _ => None,
    }
}

pub fn cells_equal(a: &Value, b: &Value, policy: &ComparisonPolicy) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => return true,
        (Value::Null, _) | (_, Value::Null) => return false,
        _ => {}
    }
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return numbers_equal(x, y, policy.float_tolerance);
    }
    match (text_of(a), text_of(b)) {
        (Some(x), Some(y)) if policy.case_sensitive_strings => x == y,
        (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

/// Total order used to canonicalize row order: NULL < numeric < text.
fn cmp_cells(a: &Value, b: &Value, case_insensitive: bool) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            _ if numeric(v).is_some() => 1,
            _ => 2,
        }
    }
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => {}
        other => return other,
    }
    match (numeric(a), numeric(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => return x.cmp(&y),
        (Some(x), Some(y)) => return x.as_f64().total_cmp(&y.as_f64()),
        _ => {}
    }
    match (text_of(a), text_of(b)) {
        (Some(x), Some(y)) if case_insensitive => x
            .to_ascii_lowercase()
            .cmp(&y.to_ascii_lowercase()),
        (Some(x), Some(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

fn cmp_rows(a: &[&Value], b: &[&Value], case_insensitive: bool) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match cmp_cells(x, y, case_insensitive) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(cols: &[&str], rows: Vec<Vec<Value>>) -> ResultSet {
        ResultSet::new(cols.iter().map(|c| c.to_string()).collect(), rows)
    }

    fn policy() -> ComparisonPolicy {
        ComparisonPolicy::default()
    }

    fn ab_rows() -> Vec<Vec<Value>> {
        vec![
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(3), Value::Int(4)],
        ]
    }

    #[test]
    fn test_reverse_order_under_default_and_strict_policy() {
        let expected = rs(&["a", "b"], ab_rows());
        let mut reversed = ab_rows();
        reversed.reverse();
        let candidate = rs(&["a", "b"], reversed);

        assert!(compare(&candidate, &expected, &policy()));
        let strict = ComparisonPolicy {
            row_order_sensitive: true,
            ..policy()
        };
        assert!(!compare(&candidate, &expected, &strict));
        assert_eq!(
            compare_detailed(&candidate, &expected, &strict),
            Err(Mismatch::Row {
                index: 0,
                sorted: false
            })
        );
    }

    #[test]
    fn test_columns_reconciled_by_name_case_insensitively() {
        let expected = rs(&["a", "b"], ab_rows());
        let candidate = rs(
            &["B", "A"],
            vec![
                vec![Value::Int(2), Value::Int(1)],
                vec![Value::Int(4), Value::Int(3)],
            ],
        );
        assert!(compare(&candidate, &expected, &policy()));
    }

    #[test]
    fn test_column_set_difference_is_not_partial_credit() {
        let expected = rs(&["a", "b"], ab_rows());
        let candidate = rs(&["a", "c"], ab_rows());
        match compare_detailed(&candidate, &expected, &policy()) {
            Err(Mismatch::Columns {
                unexpected,
                missing,
            }) => {
                assert_eq!(unexpected, vec!["c".to_string()]);
                assert_eq!(missing, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_float_tolerance_and_numeric_coercion() {
        let p = policy();
        assert!(cells_equal(&Value::Float(30.0), &Value::Float(30.0000000001), &p));
        assert!(cells_equal(&Value::Int(30), &Value::Float(30.0), &p));
        assert!(cells_equal(&Value::Text("30".into()), &Value::Int(30), &p));
        assert!(cells_equal(&Value::Bool(true), &Value::Int(1), &p));
        assert!(!cells_equal(&Value::Float(30.0), &Value::Float(30.1), &p));
        assert!(!cells_equal(&Value::Int(1), &Value::Int(2), &p));
        assert!(cells_equal(
            &Value::Float(1.0e12),
            &Value::Float(1.0e12 + 1.0),
            &p
        ));
    }

    #[test]
    fn test_null_only_equals_null() {
        let p = policy();
        assert!(cells_equal(&Value::Null, &Value::Null, &p));
        assert!(!cells_equal(&Value::Null, &Value::Int(0), &p));
        assert!(!cells_equal(&Value::Text(String::new()), &Value::Null, &p));
    }

    #[test]
    fn test_string_case_policy() {
        let p = policy();
        assert!(!cells_equal(&Value::Text("Ann".into()), &Value::Text("ann".into()), &p));
        let ci = ComparisonPolicy {
            case_sensitive_strings: false,
            ..p
        };
        assert!(cells_equal(&Value::Text("Ann".into()), &Value::Text("ann".into()), &ci));
    }

    #[test]
    fn test_row_count_mismatch() {
        let expected = rs(&["a", "b"], ab_rows());
        let candidate = rs(&["a", "b"], vec![ab_rows().remove(0)]);
        assert_eq!(
            compare_detailed(&candidate, &expected, &policy()),
            Err(Mismatch::RowCount {
                candidate: 1,
                expected: 2
            })
        );
    }

    #[test]
    fn test_mismatch_message_hides_expected_values() {
        let expected = rs(&["name"], vec![vec![Value::Text("secret-answer".into())]]);
        let candidate = rs(&["name"], vec![vec![Value::Text("guess".into())]]);
        let msg = compare_detailed(&candidate, &expected, &policy())
            .unwrap_err()
            .to_string();
        assert!(!msg.contains("secret-answer"));
    }

    #[test]
    fn test_mixed_types_sort_consistently() {
        let rows = vec![
            vec![Value::Text("x".into())],
            vec![Value::Null],
            vec![Value::Float(2.5)],
            vec![Value::Int(1)],
        ];
        let mut shuffled = rows.clone();
        shuffled.rotate_left(2);
        let a = rs(&["v"], rows);
        let b = rs(&["v"], shuffled);
        assert!(compare(&a, &b, &policy()));
        assert!(compare(&b, &a, &policy()));
    }

    #[test]
    fn test_tolerance_equal_floats_pair_up_regardless_of_order() {
        let candidate = rs(
            &["v", "tag"],
            vec![
                vec![Value::Float(0.1 + 0.2), Value::Text("a".into())],
                vec![Value::Float(0.3), Value::Text("b".into())],
            ],
        );
        let expected = rs(
            &["v", "tag"],
            vec![
                vec![Value::Float(0.3), Value::Text("a".into())],
                vec![Value::Float(0.3), Value::Text("b".into())],
            ],
        );
        assert!(compare(&candidate, &expected, &policy()));
        assert!(compare(&expected, &candidate, &policy()));
    }

    #[test]
    fn test_tolerance_ties_across_columns_are_rematched() {
        // Canonical order pairs the rows crosswise; only the swapped pairing matches.
        let candidate = rs(
            &["v", "n"],
            vec![
                vec![Value::Float(1.0), Value::Int(2)],
                vec![Value::Float(1.0000001), Value::Int(1)],
            ],
        );
        let expected = rs(
            &["v", "n"],
            vec![
                vec![Value::Float(1.0), Value::Int(2)],
                vec![Value::Float(0.9999999), Value::Int(1)],
            ],
        );
        assert!(compare(&candidate, &expected, &policy()));
        assert!(compare(&expected, &candidate, &policy()));
    }

    #[test]
    fn test_unmatched_row_reported_in_sorted_order() {
        let expected = rs(&["a", "b"], ab_rows());
        let candidate = rs(
            &["a", "b"],
            vec![
                vec![Value::Int(3), Value::Int(4)],
                vec![Value::Int(1), Value::Int(9)],
            ],
        );
        assert_eq!(
            compare_detailed(&candidate, &expected, &policy()),
            Err(Mismatch::Row {
                index: 0,
                sorted: true
            })
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn cell() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                (-3i64..3).prop_map(Value::Int),
                // Values a few ulps apart so tolerance ties are common.
                (0u8..3, 0u8..3).prop_map(|(base, jitter)| {
                    Value::Float(f64::from(base) * 0.1 + f64::from(jitter) * 1e-9)
                }),
                Just(Value::Float(0.1 + 0.2)),
                prop::sample::select(vec!["ann", "Ann", "bob", "BOB", "30"])
                    .prop_map(|s| Value::Text(s.to_string())),
                any::<bool>().prop_map(Value::Bool),
            ]
        }

        fn rows() -> impl Strategy<Value = Vec<Vec<Value>>> {
            prop::collection::vec(prop::collection::vec(cell(), 2), 0..8)
        }

        fn policies() -> impl Strategy<Value = ComparisonPolicy> {
            any::<bool>().prop_map(|case_sensitive_strings| ComparisonPolicy {
                case_sensitive_strings,
                ..ComparisonPolicy::default()
            })
        }

        proptest! {
            #[test]
            fn permuted_rows_still_compare_equal(
                (original, shuffled) in rows().prop_flat_map(|r| (Just(r.clone()), Just(r).prop_shuffle())),
                p in policies(),
            ) {
                let a = rs(&["x", "y"], original);
                let b = rs(&["x", "y"], shuffled);
                prop_assert!(compare(&b, &a, &p));
            }

            #[test]
            fn comparison_is_symmetric(a in rows(), b in rows(), p in policies()) {
                let a = rs(&["x", "y"], a);
                let b = rs(&["x", "y"], b);
                prop_assert_eq!(compare(&a, &b, &p), compare(&b, &a, &p));
            }

            #[test]
            fn jittered_rows_in_any_order_compare_equal(
                (original, shuffled) in rows().prop_flat_map(|r| (Just(r.clone()), Just(r).prop_shuffle())),
            ) {
                let p = ComparisonPolicy::default();
                let jittered: Vec<Vec<Value>> = shuffled
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|v| match v {
                                Value::Float(f) => Value::Float(f + 1e-9),
                                other => other,
                            })
                            .collect()
                    })
                    .collect();
                let a = rs(&["x", "y"], original);
                let b = rs(&["x", "y"], jittered);
                prop_assert!(compare(&b, &a, &p));
            }
        }
    }
}
