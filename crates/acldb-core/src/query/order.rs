//! Record ordering.
//!
//! Missing and null keys sort first. Values of different types order by
//! [`Value::total_cmp`]. Every ordering ends with the insertion sequence so
//! that equal keys still yield a stable total order.

use std::cmp::Ordering;

use acldb_proto::{SortDirection, SortSpec, Value};

use super::evaluator::Document;
use super::plan::Cursor;

/// Compare two optional sort keys, missing first.
pub fn compare_keys(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.total_cmp(b),
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

/// Extract the sort key of a document.
pub fn sort_key(doc: &dyn Document, sort: &[SortSpec]) -> Vec<Option<Value>> {
    sort.iter()
        .map(|spec| doc.value_at(&spec.path).map(|v| v.into_owned()))
        .collect()
}

fn compare_sort_keys(a: &[Option<Value>], b: &[Option<Value>], sort: &[SortSpec]) -> Ordering {
    for ((x, y), spec) in a.iter().zip(b).zip(sort) {
        let ordering = directed(compare_keys(x.as_ref(), y.as_ref()), spec.direction);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Compare two documents by `sort`, then by sequence.
pub fn compare_documents(a: &dyn Document, b: &dyn Document, sort: &[SortSpec]) -> Ordering {
    for spec in sort {
        let ordering = directed(
            compare_keys(
                a.value_at(&spec.path).as_deref(),
                b.value_at(&spec.path).as_deref(),
            ),
            spec.direction,
        );
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.seq().cmp(&b.seq())
}

/// Sort documents in place by `sort`, then by sequence.
pub fn sort_documents<D: Document>(docs: &mut Vec<D>, sort: &[SortSpec]) {
    if sort.is_empty() {
        docs.sort_by_key(|doc| doc.seq());
        return;
    }
    let mut keyed: Vec<(Vec<Option<Value>>, D)> = docs
        .drain(..)
        .map(|doc| (sort_key(&doc, sort), doc))
        .collect();
    keyed.sort_by(|(ka, a), (kb, b)| {
        compare_sort_keys(ka, kb, sort).then_with(|| a.seq().cmp(&b.seq()))
    });
    docs.extend(keyed.into_iter().map(|(_, doc)| doc));
}

/// Position of a document relative to a keyset cursor.
pub fn compare_to_cursor(doc: &dyn Document, cursor: &Cursor) -> Ordering {
    let key = sort_key(doc, &cursor.sort);
    compare_sort_keys(&key, &cursor.values, &cursor.sort).then_with(|| doc.seq().cmp(&cursor.seq))
}

/// Apply skip and limit to an ordered list.
pub fn paginate<T>(items: Vec<T>, skip: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let skip = skip.unwrap_or(0);
    match limit {
        Some(limit) => items.into_iter().skip(skip).take(limit).collect(),
        None => items.into_iter().skip(skip).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acldb_proto::ObjectRecord;

    fn record(id: &str, seq: u64, score: Option<i64>) -> ObjectRecord {
        let mut record = ObjectRecord::new("Post", id);
        record.seq = seq;
        if let Some(score) = score {
            record.attributes.insert("score".into(), Value::from(score));
        }
        record
    }

    #[test]
    fn test_missing_first_then_seq() {
        let mut docs = vec![
            record("c", 3, Some(1)),
            record("a", 1, Some(1)),
            record("b", 2, None),
        ];
        sort_documents(&mut docs, &[SortSpec::asc("score")]);
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        sort_documents(&mut docs, &[SortSpec::desc("score")]);
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_cursor_position() {
        let cursor = Cursor {
            sort: vec![SortSpec::asc("score")],
            values: vec![Some(Value::from(1))],
            seq: 1,
        };
        assert_eq!(compare_to_cursor(&record("a", 1, Some(1)), &cursor), Ordering::Equal);
        assert_eq!(compare_to_cursor(&record("c", 3, Some(1)), &cursor), Ordering::Greater);
        assert_eq!(compare_to_cursor(&record("b", 2, None), &cursor), Ordering::Less);
    }

    #[test]
    fn test_paginate() {
        assert_eq!(paginate(vec![1, 2, 3, 4], Some(1), Some(2)), vec![2, 3]);
        assert_eq!(paginate(vec![1, 2], None, None), vec![1, 2]);
    }
}
