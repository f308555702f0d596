// ABOUTME: Column value type used by row mutations, the in-memory store, and feeds
// ABOUTME: Provides null-safe "distinct from" comparison and PostgreSQL parameter binding

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::error::Error;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type, WrongType};
use uuid::Uuid;

/// A row image keyed by column name. Missing columns read as NULL.
pub type Row = BTreeMap<String, Value>;

/// A single column value.
///
/// Equality, ordering and hashing are total (floats compare by
/// `f64::total_cmp`) so values can key maps; SQL NULL semantics live in
/// [`is_distinct_from`] instead.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Text(_) => 4,
            Value::Uuid(_) => 5,
            Value::Timestamp(_) => 6,
            Value::Json(_) => 7,
        }
    }

    /// Map a JSON value (as produced by `to_jsonb(column)`) onto a column value.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Null-safe inequality: NULL is distinct from any value, two NULLs are not
/// distinct, and non-null values are distinct when unequal.
///
/// # Examples
///
/// ```
/// # use table_changes::value::{is_distinct_from, Value};
/// assert!(!is_distinct_from(&Value::Null, &Value::Null));
/// assert!(is_distinct_from(&Value::Null, &Value::Int(1)));
/// assert!(is_distinct_from(&Value::Int(1), &Value::Int(2)));
/// assert!(!is_distinct_from(&Value::from("a"), &Value::from("a")));
/// ```
pub fn is_distinct_from(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => false,
        (Value::Null, _) | (_, Value::Null) => true,
        (l, r) => l.cmp(r) != Ordering::Equal,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Uuid(u) => u.hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::Json(j) => j.to_string().hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Binds a value to a parameter of the column's declared type.
///
/// Values convert into the target type where the conversion is exact: integers
/// and floats into `numeric`, text (as read back from the feed) into
/// `numeric`, timestamps, dates and uuids. Any other mismatch fails the bind
/// with [`WrongType`] instead of writing a foreign binary encoding.
impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => bind(b, ty, out),
            // Narrow to the declared column width; out-of-range values fail the bind
            Value::Int(i) => match ty {
                k if *k == Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                k if *k == Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                k if *k == Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                k if *k == Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                k if *k == Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                _ => bind(i, ty, out),
            },
            Value::Float(f) => match ty {
                k if *k == Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                k if *k == Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                _ => bind(f, ty, out),
            },
            Value::Text(s) => text_to_sql(s, ty, out),
            Value::Uuid(u) => bind(u, ty, out),
            Value::Timestamp(t) => match ty {
                k if *k == Type::TIMESTAMP => t.naive_utc().to_sql(ty, out),
                k if *k == Type::DATE => t.date_naive().to_sql(ty, out),
                _ => bind(t, ty, out),
            },
            Value::Json(j) => bind(j, ty, out),
        }
    }

    // Checked per variant in to_sql
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind<T: ToSql>(
    value: &T,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    if !T::accepts(ty) {
        return Err(Box::new(WrongType::new::<T>(ty.clone())));
    }
    value.to_sql(ty, out)
}

/// Text parses into the typed columns jsonb renders as strings.
fn text_to_sql(
    text: &str,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    match ty {
        k if *k == Type::NUMERIC => Decimal::from_str(text)
            .or_else(|_| Decimal::from_scientific(text))?
            .to_sql(ty, out),
        k if *k == Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(text)?
            .with_timezone(&Utc)
            .to_sql(ty, out),
        k if *k == Type::TIMESTAMP => {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")?.to_sql(ty, out)
        }
        k if *k == Type::DATE => NaiveDate::parse_from_str(text, "%Y-%m-%d")?.to_sql(ty, out),
        k if *k == Type::UUID => Uuid::parse_str(text)?.to_sql(ty, out),
        _ => bind(&text, ty, out),
    }
}

/// Build a [`Row`] from `(column, value)` pairs.
///
/// ```
/// # use table_changes::value::{row, Value};
/// let r = row([("kode", Value::from(1)), ("navn", Value::from("foo"))]);
/// assert_eq!(r["navn"], Value::from("foo"));
/// ```
pub fn row<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_safe_distinctness() {
        assert!(!is_distinct_from(&Value::Null, &Value::Null));
        assert!(is_distinct_from(&Value::Null, &Value::from("x")));
        assert!(is_distinct_from(&Value::from("x"), &Value::Null));
        assert!(!is_distinct_from(&Value::from(3), &Value::from(3i64)));
        assert!(is_distinct_from(&Value::from(3), &Value::from(4)));
    }

    #[test]
    fn test_float_comparison_is_total() {
        assert!(!is_distinct_from(&Value::Float(f64::NAN), &Value::Float(f64::NAN)));
        assert!(is_distinct_from(&Value::Float(0.5), &Value::Float(0.25)));
    }

    #[test]
    fn test_mixed_types_are_distinct() {
        assert!(is_distinct_from(&Value::from(1), &Value::from("1")));
        assert!(Value::Null < Value::from(false));
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Value::from_json(serde_json::json!(60851)), Value::Int(60851));
        assert_eq!(Value::from_json(serde_json::json!("foo")), Value::from("foo"));
        assert_eq!(Value::from_json(serde_json::json!(null)), Value::Null);
        assert_eq!(Value::from_json(serde_json::json!(1.5)), Value::Float(1.5));
        assert!(matches!(
            Value::from_json(serde_json::json!({"type": "Point"})),
            Value::Json(_)
        ));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::from("a"));
    }

    #[test]
    fn test_to_sql_narrows_integers() {
        let mut buf = BytesMut::new();
        Value::Int(7).to_sql(&Type::INT4, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);

        let mut buf = BytesMut::new();
        Value::Int(7).to_sql(&Type::INT8, &mut buf).unwrap();
        assert_eq!(buf.len(), 8);

        let mut buf = BytesMut::new();
        assert!(Value::Int(i64::MAX).to_sql(&Type::INT2, &mut buf).is_err());

        let mut buf = BytesMut::new();
        assert!(matches!(
            Value::Null.to_sql(&Type::TEXT, &mut buf).unwrap(),
            IsNull::Yes
        ));
    }

    #[test]
    fn test_to_sql_converts_into_numeric() {
        let mut expected = BytesMut::new();
        Decimal::from(100).to_sql(&Type::NUMERIC, &mut expected).unwrap();

        let mut buf = BytesMut::new();
        Value::Int(100).to_sql(&Type::NUMERIC, &mut buf).unwrap();
        assert_eq!(buf, expected);

        let mut buf = BytesMut::new();
        Value::from("100").to_sql(&Type::NUMERIC, &mut buf).unwrap();
        assert_eq!(buf, expected);

        let mut buf = BytesMut::new();
        assert!(Value::from("ten").to_sql(&Type::NUMERIC, &mut buf).is_err());
    }

    #[test]
    fn test_to_sql_parses_feed_timestamps() {
        let instant = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.5+02:00")
            .unwrap()
            .with_timezone(&Utc);
        let mut expected = BytesMut::new();
        instant.to_sql(&Type::TIMESTAMPTZ, &mut expected).unwrap();

        // jsonb renders timestamptz as RFC 3339 text
        let mut buf = BytesMut::new();
        Value::from("2024-05-01T10:00:00.5+02:00")
            .to_sql(&Type::TIMESTAMPTZ, &mut buf)
            .unwrap();
        assert_eq!(buf, expected);

        let mut buf = BytesMut::new();
        Value::from(instant).to_sql(&Type::TIMESTAMPTZ, &mut buf).unwrap();
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_to_sql_rejects_mismatched_types() {
        let mut buf = BytesMut::new();
        let err = Value::Int(1).to_sql(&Type::TEXT, &mut buf).err().unwrap();
        assert!(err.is::<WrongType>());
        let err = Value::from("x").to_sql(&Type::INT4, &mut buf).err().unwrap();
        assert!(err.is::<WrongType>());
        assert!(Value::Bool(true).to_sql(&Type::NUMERIC, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_to_sql_binds_parsed_uuids() {
        let text = "0a3f50a0-7362-32b8-e044-0003ba298018";
        let id = Uuid::parse_str(text).unwrap();
        let mut expected = BytesMut::new();
        Value::from(id).to_sql(&Type::UUID, &mut expected).unwrap();

        let mut buf = BytesMut::new();
        Value::from(text).to_sql(&Type::UUID, &mut buf).unwrap();
        assert_eq!(buf, expected);
        assert!(Value::from("not-a-uuid").to_sql(&Type::UUID, &mut BytesMut::new()).is_err());
    }
}
