//! Scalar type maps: how each logical scalar type is stored, rendered as a
//! literal, bound as a parameter and read back from a driver.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::enums::DatabaseType;
use crate::query_ast::ast::{Expression, Literal};
use crate::value::{NativeValue, Value};

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TypeMapError {
    #[error("no type map registered for {0:?}")]
    Unmapped(ScalarType),
    #[error("cannot encode {value} as {ty:?}")]
    Encode { ty: ScalarType, value: String },
    #[error("cannot decode {native} as {ty:?}")]
    Decode { ty: ScalarType, native: String },
}

/// Logical scalar types known to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Boolean,
    Integer,
    Decimal,
    Float,
    String,
    Date,
    DateTime,
    /// Large binary object, fetched deferred.
    Binary,
    /// Large character object, fetched deferred.
    Text,
}

/// Native representation a parameter is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Boolean,
    Integer,
    Float,
    Text,
    Bytes,
}

/// Per-scalar-type storage rules for one backend.
pub trait ScalarTypeMap: Send + Sync {
    fn scalar_type(&self) -> ScalarType;

    /// Native domain used in DDL.
    fn domain_name(&self) -> &str;

    /// SQL literal for `value`.
    fn literal(&self, value: &Value) -> Result<Expression, TypeMapError>;

    /// Native type parameters of this scalar type are bound as.
    fn parameter_type(&self) -> NativeType;

    fn encode(&self, value: &Value) -> Result<NativeValue, TypeMapError>;

    fn decode(&self, native: NativeValue) -> Result<Value, TypeMapError>;

    /// Large objects are read through a deferred stream instead of inline.
    fn is_large_object(&self) -> bool {
        false
    }
}

fn encode_error(ty: ScalarType, value: &Value) -> TypeMapError {
    TypeMapError::Encode { ty, value: format!("{:?}", value) }
}

fn decode_error(ty: ScalarType, native: &NativeValue) -> TypeMapError {
    TypeMapError::Decode { ty, native: format!("{:?}", native) }
}

pub struct BooleanMap {
    domain: String,
    native: bool,
}

impl BooleanMap {
    pub fn new(domain: impl Into<String>, native: bool) -> Self {
        Self { domain: domain.into(), native }
    }
}

impl ScalarTypeMap for BooleanMap {
    fn scalar_type(&self) -> ScalarType {
        ScalarType::Boolean
    }

    fn domain_name(&self) -> &str {
        &self.domain
    }

    fn literal(&self, value: &Value) -> Result<Expression, TypeMapError> {
        match value {
            Value::Null => Ok(Expression::null()),
            Value::Boolean(b) if self.native => Ok(Expression::Literal(Literal::Boolean(*b))),
            Value::Boolean(b) => Ok(Expression::integer(i64::from(*b))),
            other => Err(encode_error(ScalarType::Boolean, other)),
        }
    }

    fn parameter_type(&self) -> NativeType {
        if self.native { NativeType::Boolean } else { NativeType::Integer }
    }

    fn encode(&self, value: &Value) -> Result<NativeValue, TypeMapError> {
        match value {
            Value::Null => Ok(NativeValue::Null),
            Value::Boolean(b) if self.native => Ok(NativeValue::Boolean(*b)),
            Value::Boolean(b) => Ok(NativeValue::Integer(i64::from(*b))),
            other => Err(encode_error(ScalarType::Boolean, other)),
        }
    }

    fn decode(&self, native: NativeValue) -> Result<Value, TypeMapError> {
        match native {
            NativeValue::Null => Ok(Value::Null),
            NativeValue::Boolean(b) => Ok(Value::Boolean(b)),
            NativeValue::Integer(i) => Ok(Value::Boolean(i != 0)),
            NativeValue::Text(ref s) => match s.as_str() {
                "1" | "true" | "TRUE" | "t" => Ok(Value::Boolean(true)),
                "0" | "false" | "FALSE" | "f" => Ok(Value::Boolean(false)),
                _ => Err(decode_error(ScalarType::Boolean, &native)),
            },
            other => Err(decode_error(ScalarType::Boolean, &other)),
        }
    }
}

pub struct IntegerMap {
    domain: String,
}

impl IntegerMap {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into() }
    }
}

impl ScalarTypeMap for IntegerMap {
    fn scalar_type(&self) -> ScalarType {
        ScalarType::Integer
    }

    fn domain_name(&self) -> &str {
        &self.domain
    }

    fn literal(&self, value: &Value) -> Result<Expression, TypeMapError> {
        match value {
            Value::Null => Ok(Expression::null()),
            Value::Integer(i) => Ok(Expression::integer(*i)),
            other => Err(encode_error(ScalarType::Integer, other)),
        }
    }

    fn parameter_type(&self) -> NativeType {
        NativeType::Integer
    }

    fn encode(&self, value: &Value) -> Result<NativeValue, TypeMapError> {
        match value {
            Value::Null => Ok(NativeValue::Null),
            Value::Integer(i) => Ok(NativeValue::Integer(*i)),
            other => Err(encode_error(ScalarType::Integer, other)),
        }
    }

    fn decode(&self, native: NativeValue) -> Result<Value, TypeMapError> {
        match native {
            NativeValue::Null => Ok(Value::Null),
            NativeValue::Integer(i) => Ok(Value::Integer(i)),
            NativeValue::Boolean(b) => Ok(Value::Integer(i64::from(b))),
            NativeValue::Float(f) if f.fract() == 0.0 => Ok(Value::Integer(f as i64)),
            NativeValue::Text(ref s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| decode_error(ScalarType::Integer, &native)),
            other => Err(decode_error(ScalarType::Integer, &other)),
        }
    }
}

/// Exact numerics travel as text so no backend rounds them through a float.
pub struct DecimalMap {
    domain: String,
}

impl DecimalMap {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into() }
    }
}

impl ScalarTypeMap for DecimalMap {
    fn scalar_type(&self) -> ScalarType {
        ScalarType::Decimal
    }

    fn domain_name(&self) -> &str {
        &self.domain
    }

    fn literal(&self, value: &Value) -> Result<Expression, TypeMapError> {
        match value {
            Value::Null => Ok(Expression::null()),
            Value::Decimal(d) => Ok(Expression::Literal(Literal::Decimal(d.normalize().to_string()))),
            Value::Integer(i) => Ok(Expression::Literal(Literal::Decimal(i.to_string()))),
            other => Err(encode_error(ScalarType::Decimal, other)),
        }
    }

    fn parameter_type(&self) -> NativeType {
        NativeType::Text
    }

    fn encode(&self, value: &Value) -> Result<NativeValue, TypeMapError> {
        match value {
            Value::Null => Ok(NativeValue::Null),
            Value::Decimal(d) => Ok(NativeValue::Text(d.to_string())),
            Value::Integer(i) => Ok(NativeValue::Text(i.to_string())),
            other => Err(encode_error(ScalarType::Decimal, other)),
        }
    }

    fn decode(&self, native: NativeValue) -> Result<Value, TypeMapError> {
        match native {
            NativeValue::Null => Ok(Value::Null),
            NativeValue::Integer(i) => Ok(Value::Decimal(Decimal::from(i))),
            NativeValue::Float(f) => Decimal::try_from(f)
                .map(Value::Decimal)
                .map_err(|_| decode_error(ScalarType::Decimal, &native)),
            NativeValue::Text(ref s) => s
                .trim()
                .parse::<Decimal>()
                .map(Value::Decimal)
                .map_err(|_| decode_error(ScalarType::Decimal, &native)),
            other => Err(decode_error(ScalarType::Decimal, &other)),
        }
    }
}

pub struct FloatMap {
    domain: String,
}

impl FloatMap {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into() }
    }
}

impl ScalarTypeMap for FloatMap {
    fn scalar_type(&self) -> ScalarType {
        ScalarType::Float
    }

    fn domain_name(&self) -> &str {
        &self.domain
    }

    fn literal(&self, value: &Value) -> Result<Expression, TypeMapError> {
        match value {
            Value::Null => Ok(Expression::null()),
            Value::Float(f) => Ok(Expression::Literal(Literal::Float(*f))),
            Value::Integer(i) => Ok(Expression::Literal(Literal::Float(*i as f64))),
            other => Err(encode_error(ScalarType::Float, other)),
        }
    }

    fn parameter_type(&self) -> NativeType {
        NativeType::Float
    }

    fn encode(&self, value: &Value) -> Result<NativeValue, TypeMapError> {
        match value {
            Value::Null => Ok(NativeValue::Null),
            Value::Float(f) => Ok(NativeValue::Float(*f)),
            Value::Integer(i) => Ok(NativeValue::Float(*i as f64)),
            other => Err(encode_error(ScalarType::Float, other)),
        }
    }

    fn decode(&self, native: NativeValue) -> Result<Value, TypeMapError> {
        match native {
            NativeValue::Null => Ok(Value::Null),
            NativeValue::Float(f) => Ok(Value::Float(f)),
            NativeValue::Integer(i) => Ok(Value::Float(i as f64)),
            NativeValue::Text(ref s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| decode_error(ScalarType::Float, &native)),
            other => Err(decode_error(ScalarType::Float, &other)),
        }
    }
}

/// Character data; `large` marks the deferred large-object variant.
pub struct StringMap {
    domain: String,
    large: bool,
}

impl StringMap {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), large: false }
    }

    pub fn large(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), large: true }
    }
}

impl ScalarTypeMap for StringMap {
    fn scalar_type(&self) -> ScalarType {
        if self.large { ScalarType::Text } else { ScalarType::String }
    }

    fn domain_name(&self) -> &str {
        &self.domain
    }

    fn literal(&self, value: &Value) -> Result<Expression, TypeMapError> {
        match value {
            Value::Null => Ok(Expression::null()),
            Value::String(s) => Ok(Expression::Literal(Literal::String(s.clone()))),
            other => Err(encode_error(self.scalar_type(), other)),
        }
    }

    fn parameter_type(&self) -> NativeType {
        NativeType::Text
    }

    fn encode(&self, value: &Value) -> Result<NativeValue, TypeMapError> {
        match value {
            Value::Null => Ok(NativeValue::Null),
            Value::String(s) => Ok(NativeValue::Text(s.clone())),
            other => Err(encode_error(self.scalar_type(), other)),
        }
    }

    fn decode(&self, native: NativeValue) -> Result<Value, TypeMapError> {
        match native {
            NativeValue::Null => Ok(Value::Null),
            NativeValue::Text(s) => Ok(Value::String(s)),
            NativeValue::Integer(i) => Ok(Value::String(i.to_string())),
            NativeValue::Float(f) => Ok(Value::String(f.to_string())),
            NativeValue::Bytes(ref b) => String::from_utf8(b.clone())
                .map(Value::String)
                .map_err(|_| decode_error(self.scalar_type(), &native)),
            other => Err(decode_error(self.scalar_type(), &other)),
        }
    }

    fn is_large_object(&self) -> bool {
        self.large
    }
}

/// Dates and timestamps; stored as ISO text, literal optionally keyword-typed.
pub struct TemporalMap {
    ty: ScalarType,
    domain: String,
    typed_literals: bool,
}

impl TemporalMap {
    pub fn date(domain: impl Into<String>, typed_literals: bool) -> Self {
        Self { ty: ScalarType::Date, domain: domain.into(), typed_literals }
    }

    pub fn date_time(domain: impl Into<String>, typed_literals: bool) -> Self {
        Self { ty: ScalarType::DateTime, domain: domain.into(), typed_literals }
    }

    fn render(&self, value: &Value) -> Result<Option<String>, TypeMapError> {
        match (self.ty, value) {
            (_, Value::Null) => Ok(None),
            (ScalarType::Date, Value::Date(d)) => Ok(Some(d.format(DATE_FORMAT).to_string())),
            (ScalarType::DateTime, Value::DateTime(d)) => Ok(Some(d.format(DATE_TIME_FORMAT).to_string())),
            (ScalarType::DateTime, Value::Date(d)) => Ok(Some(format!("{} 00:00:00", d.format(DATE_FORMAT)))),
            (ty, other) => Err(encode_error(ty, other)),
        }
    }
}

impl ScalarTypeMap for TemporalMap {
    fn scalar_type(&self) -> ScalarType {
        self.ty
    }

    fn domain_name(&self) -> &str {
        &self.domain
    }

    fn literal(&self, value: &Value) -> Result<Expression, TypeMapError> {
        Ok(match self.render(value)? {
            None => Expression::null(),
            Some(text) if self.typed_literals => {
                let keyword = if self.ty == ScalarType::Date { "DATE" } else { "TIMESTAMP" };
                Expression::Literal(Literal::Typed { domain: keyword.to_string(), text })
            }
            Some(text) => Expression::Literal(Literal::String(text)),
        })
    }

    fn parameter_type(&self) -> NativeType {
        NativeType::Text
    }

    fn encode(&self, value: &Value) -> Result<NativeValue, TypeMapError> {
        Ok(self.render(value)?.map(NativeValue::Text).unwrap_or(NativeValue::Null))
    }

    fn decode(&self, native: NativeValue) -> Result<Value, TypeMapError> {
        let text = match &native {
            NativeValue::Null => return Ok(Value::Null),
            NativeValue::Text(s) => s.trim(),
            _ => return Err(decode_error(self.ty, &native)),
        };
        match self.ty {
            ScalarType::Date => NaiveDate::parse_from_str(text, DATE_FORMAT)
                .or_else(|_| NaiveDateTime::parse_from_str(text, DATE_TIME_FORMAT).map(|d| d.date()))
                .map(Value::Date)
                .map_err(|_| decode_error(self.ty, &native)),
            _ => NaiveDateTime::parse_from_str(text, DATE_TIME_FORMAT)
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
                .map(Value::DateTime)
                .map_err(|_| decode_error(self.ty, &native)),
        }
    }
}

pub struct BinaryMap {
    domain: String,
}

impl BinaryMap {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into() }
    }
}

impl ScalarTypeMap for BinaryMap {
    fn scalar_type(&self) -> ScalarType {
        ScalarType::Binary
    }

    fn domain_name(&self) -> &str {
        &self.domain
    }

    fn literal(&self, value: &Value) -> Result<Expression, TypeMapError> {
        match value {
            Value::Null => Ok(Expression::null()),
            Value::Binary(b) => Ok(Expression::Literal(Literal::Binary(b.clone()))),
            other => Err(encode_error(ScalarType::Binary, other)),
        }
    }

    fn parameter_type(&self) -> NativeType {
        NativeType::Bytes
    }

    fn encode(&self, value: &Value) -> Result<NativeValue, TypeMapError> {
        match value {
            Value::Null => Ok(NativeValue::Null),
            Value::Binary(b) => Ok(NativeValue::Bytes(b.clone())),
            other => Err(encode_error(ScalarType::Binary, other)),
        }
    }

    fn decode(&self, native: NativeValue) -> Result<Value, TypeMapError> {
        match native {
            NativeValue::Null => Ok(Value::Null),
            NativeValue::Bytes(b) => Ok(Value::Binary(b)),
            NativeValue::Text(s) => Ok(Value::Binary(s.into_bytes())),
            other => Err(decode_error(ScalarType::Binary, &other)),
        }
    }

    fn is_large_object(&self) -> bool {
        true
    }
}

/// Type maps for one backend, keyed by scalar type.
#[derive(Clone, Default)]
pub struct TypeMapRegistry {
    maps: HashMap<ScalarType, Arc<dyn ScalarTypeMap>>,
}

impl TypeMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, map: Arc<dyn ScalarTypeMap>) {
        self.maps.insert(map.scalar_type(), map);
    }

    pub fn get(&self, ty: ScalarType) -> Result<&dyn ScalarTypeMap, TypeMapError> {
        self.maps.get(&ty).map(|m| &**m).ok_or(TypeMapError::Unmapped(ty))
    }

    pub fn encode(&self, ty: ScalarType, value: &Value) -> Result<NativeValue, TypeMapError> {
        self.get(ty)?.encode(value)
    }

    pub fn decode(&self, ty: ScalarType, native: NativeValue) -> Result<Value, TypeMapError> {
        self.get(ty)?.decode(native)
    }

    pub fn is_large_object(&self, ty: ScalarType) -> bool {
        self.maps.get(&ty).is_some_and(|m| m.is_large_object())
    }

    /// Default maps for a backend.
    pub fn for_dialect(db_type: DatabaseType) -> Self {
        let mut registry = Self::new();
        let maps: Vec<Arc<dyn ScalarTypeMap>> = match db_type {
            DatabaseType::SQLite => vec![
                Arc::new(BooleanMap::new("INTEGER", false)),
                Arc::new(IntegerMap::new("INTEGER")),
                Arc::new(DecimalMap::new("TEXT")),
                Arc::new(FloatMap::new("REAL")),
                Arc::new(StringMap::new("TEXT")),
                Arc::new(TemporalMap::date("TEXT", false)),
                Arc::new(TemporalMap::date_time("TEXT", false)),
                Arc::new(BinaryMap::new("BLOB")),
                Arc::new(StringMap::large("TEXT")),
            ],
            DatabaseType::PostgreSQL => vec![
                Arc::new(BooleanMap::new("BOOLEAN", true)),
                Arc::new(IntegerMap::new("BIGINT")),
                Arc::new(DecimalMap::new("NUMERIC(28, 8)")),
                Arc::new(FloatMap::new("DOUBLE PRECISION")),
                Arc::new(StringMap::new("VARCHAR(255)")),
                Arc::new(TemporalMap::date("DATE", true)),
                Arc::new(TemporalMap::date_time("TIMESTAMP", true)),
                Arc::new(BinaryMap::new("BYTEA")),
                Arc::new(StringMap::large("TEXT")),
            ],
            DatabaseType::MySQL => vec![
                Arc::new(BooleanMap::new("TINYINT", false)),
                Arc::new(IntegerMap::new("BIGINT")),
                Arc::new(DecimalMap::new("DECIMAL(28, 8)")),
                Arc::new(FloatMap::new("DOUBLE")),
                Arc::new(StringMap::new("VARCHAR(255)")),
                Arc::new(TemporalMap::date("DATE", false)),
                Arc::new(TemporalMap::date_time("DATETIME", false)),
                Arc::new(BinaryMap::new("LONGBLOB")),
                Arc::new(StringMap::large("LONGTEXT")),
            ],
            DatabaseType::MsSQL => vec![
                Arc::new(BooleanMap::new("BIT", false)),
                Arc::new(IntegerMap::new("BIGINT")),
                Arc::new(DecimalMap::new("DECIMAL(28, 8)")),
                Arc::new(FloatMap::new("FLOAT")),
                Arc::new(StringMap::new("NVARCHAR(255)")),
                Arc::new(TemporalMap::date("DATE", false)),
                Arc::new(TemporalMap::date_time("DATETIME2", false)),
                Arc::new(BinaryMap::new("VARBINARY(MAX)")),
                Arc::new(StringMap::large("NVARCHAR(MAX)")),
            ],
            DatabaseType::Generic => vec![
                Arc::new(BooleanMap::new("SMALLINT", false)),
                Arc::new(IntegerMap::new("BIGINT")),
                Arc::new(DecimalMap::new("DECIMAL(28, 8)")),
                Arc::new(FloatMap::new("DOUBLE PRECISION")),
                Arc::new(StringMap::new("VARCHAR(255)")),
                Arc::new(TemporalMap::date("DATE", true)),
                Arc::new(TemporalMap::date_time("TIMESTAMP", true)),
                Arc::new(BinaryMap::new("BLOB")),
                Arc::new(StringMap::large("CLOB")),
            ],
        };
        for map in maps {
            registry.register(map);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_follows_native_support() {
        let sqlite = TypeMapRegistry::for_dialect(DatabaseType::SQLite);
        assert_eq!(sqlite.encode(ScalarType::Boolean, &Value::Boolean(true)).unwrap(), NativeValue::Integer(1));
        assert_eq!(sqlite.decode(ScalarType::Boolean, NativeValue::Integer(0)).unwrap(), Value::Boolean(false));

        let pg = TypeMapRegistry::for_dialect(DatabaseType::PostgreSQL);
        assert_eq!(
            pg.get(ScalarType::Boolean).unwrap().literal(&Value::Boolean(false)).unwrap(),
            Expression::Literal(Literal::Boolean(false))
        );
    }

    #[test]
    fn decimal_survives_text_storage() {
        let maps = TypeMapRegistry::for_dialect(DatabaseType::SQLite);
        let d: Decimal = "12.3400".parse().unwrap();
        let native = maps.encode(ScalarType::Decimal, &Value::Decimal(d)).unwrap();
        assert_eq!(maps.decode(ScalarType::Decimal, native).unwrap(), Value::Decimal(d));
    }

    #[test]
    fn temporal_literals_are_typed_only_where_supported() {
        let date = Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let generic = TypeMapRegistry::for_dialect(DatabaseType::Generic);
        assert_eq!(
            generic.get(ScalarType::Date).unwrap().literal(&date).unwrap(),
            Expression::Literal(Literal::Typed { domain: "DATE".into(), text: "2024-02-29".into() })
        );
        let sqlite = TypeMapRegistry::for_dialect(DatabaseType::SQLite);
        assert_eq!(
            sqlite.get(ScalarType::Date).unwrap().literal(&date).unwrap(),
            Expression::Literal(Literal::String("2024-02-29".into()))
        );
    }

    #[test]
    fn date_time_decodes_with_and_without_fraction() {
        let maps = TypeMapRegistry::for_dialect(DatabaseType::SQLite);
        let plain = maps.decode(ScalarType::DateTime, NativeValue::Text("2024-01-02 03:04:05".into())).unwrap();
        let fractional = maps.decode(ScalarType::DateTime, NativeValue::Text("2024-01-02 03:04:05.250".into())).unwrap();
        assert!(matches!(plain, Value::DateTime(_)));
        assert!(matches!(fractional, Value::DateTime(_)));
        assert_ne!(plain, fractional);
    }

    #[test]
    fn large_objects_are_flagged() {
        let maps = TypeMapRegistry::for_dialect(DatabaseType::MsSQL);
        assert!(maps.is_large_object(ScalarType::Binary));
        assert!(maps.is_large_object(ScalarType::Text));
        assert!(!maps.is_large_object(ScalarType::String));
    }

    #[test]
    fn mismatched_value_is_an_encode_error() {
        let maps = TypeMapRegistry::for_dialect(DatabaseType::Generic);
        let err = maps.encode(ScalarType::Integer, &Value::String("x".into())).unwrap_err();
        assert!(matches!(err, TypeMapError::Encode { ty: ScalarType::Integer, .. }));
    }
}
