//! Equality, ordering and canonical encoding of [`FirestoreValue`]s.

use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

pub fn equals(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    if left.type_order() != right.type_order() {
        return false;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a == b,
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a == b,
        (ValueKind::Double(a), ValueKind::Double(b)) => {
            if a.is_nan() && b.is_nan() {
                true
            } else {
                a == b && a.is_sign_negative() == b.is_sign_negative()
            }
        }
        (ValueKind::Integer(_), ValueKind::Double(_))
        | (ValueKind::Double(_), ValueKind::Integer(_)) => false,
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a == b,
        (ValueKind::ServerTimestamp(a), ValueKind::ServerTimestamp(b)) => {
            a.local_write_time == b.local_write_time
        }
        (ValueKind::String(a), ValueKind::String(b)) => a == b,
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a == b,
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a == b,
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b) == Ordering::Equal,
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a.values().iter().zip(b.values()).all(|(l, r)| equals(l, r))
        }
        (ValueKind::Vector(a), ValueKind::Vector(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(l, r)| l.total_cmp(r) == Ordering::Equal)
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => map_equals(a, b),
        _ => false,
    }
}

fn map_equals(left: &MapValue, right: &MapValue) -> bool {
    left.fields().len() == right.fields().len()
        && left
            .fields()
            .iter()
            .all(|(key, value)| right.fields().get(key).map_or(false, |other| equals(value, other)))
}

/// Total ordering across all value types.
pub fn compare(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = left.type_order();
    let right_order = right.type_order();
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::ServerTimestamp(a), ValueKind::ServerTimestamp(b)) => {
            a.local_write_time.cmp(&b.local_write_time)
        }
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.as_slice().cmp(b.as_slice()),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => compare_sequences(a.values(), b.values()),
        (ValueKind::Vector(a), ValueKind::Vector(b)) => a
            .len()
            .cmp(&b.len())
            .then_with(|| {
                a.iter()
                    .zip(b)
                    .map(|(l, r)| compare_doubles(*l, *r))
                    .find(|ordering| *ordering != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            }),
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    // Doubles outside the i64 range cannot be compared via truncation.
    if double >= 9.223_372_036_854_776e18 {
        return Ordering::Less;
    }
    if double < -9.223_372_036_854_776e18 {
        return Ordering::Greater;
    }
    let truncated = double.trunc() as i64;
    match integer.cmp(&truncated) {
        Ordering::Equal => {
            let fraction = double - double.trunc();
            if fraction > 0.0 {
                Ordering::Less
            } else if fraction < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let right_segments = right.split('/');
    for (l, r) in left_segments.clone().zip(right_segments.clone()) {
        match l.cmp(r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left_segments.count().cmp(&right_segments.count())
}

fn compare_sequences(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right) {
        match compare(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.len().cmp(&right.len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_entries = left.fields().iter();
    let mut right_entries = right.fields().iter();
    loop {
        match (left_entries.next(), right_entries.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.cmp(rk).then_with(|| compare(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// Stable string form used to build target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ValueKind::Integer(i) => out.push_str(&i.to_string()),
        ValueKind::Double(d) => out.push_str(&format!("{d:?}")),
        ValueKind::Timestamp(t) => out.push_str(&format!("time({},{})", t.seconds, t.nanos)),
        ValueKind::ServerTimestamp(t) => out.push_str(&format!(
            "server_timestamp({},{})",
            t.local_write_time.seconds, t.local_write_time.nanos
        )),
        ValueKind::String(s) => out.push_str(s),
        ValueKind::Bytes(b) => out.push_str(&b.to_base64()),
        ValueKind::Reference(r) => out.push_str(r),
        ValueKind::GeoPoint(g) => out.push_str(&format!("geo({},{})", g.latitude(), g.longitude())),
        ValueKind::Array(a) => {
            out.push('[');
            for (index, item) in a.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        ValueKind::Vector(v) => {
            out.push_str("vector(");
            let parts: Vec<String> = v.iter().map(|d| format!("{d:?}")).collect();
            out.push_str(&parts.join(","));
            out.push(')');
        }
        ValueKind::Map(m) => {
            out.push('{');
            for (index, (key, item)) in m.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

/// `true` when `haystack` contains an element equal to `needle`.
pub fn array_contains(haystack: &[FirestoreValue], needle: &FirestoreValue) -> bool {
    haystack.iter().any(|candidate| equals(candidate, needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(
            compare(&FirestoreValue::from_integer(1), &FirestoreValue::from_double(1.0)),
            Ordering::Equal
        );
        assert!(!equals(
            &FirestoreValue::from_integer(1),
            &FirestoreValue::from_double(1.0)
        ));
    }

    #[test]
    fn nan_and_signed_zero_equality() {
        assert!(equals(
            &FirestoreValue::from_double(f64::NAN),
            &FirestoreValue::from_double(f64::NAN)
        ));
        assert!(!equals(
            &FirestoreValue::from_double(0.0),
            &FirestoreValue::from_double(-0.0)
        ));
    }

    #[test]
    fn canonical_ids_are_stable() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), FirestoreValue::from_integer(2));
        map.insert("a".to_string(), FirestoreValue::from_array(vec![
            FirestoreValue::from_bool(true),
            FirestoreValue::null(),
        ]));
        assert_eq!(
            canonical_id(&FirestoreValue::from_map(map)),
            "{a:[true,null],b:2}"
        );
    }
}
