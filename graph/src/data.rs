use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::field::Field;

/// Data type of a socket value. Every scalar type doubles as the base type of
/// a lazy field, so a socket declared as e.g. `Int` may carry either an `Int`
/// scalar or a `Field` whose base type is `Int`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Int,
    Bool,
    String,
}

/// A literal value stored on a socket. Unlike [`Value`], this is part of the
/// serialized graph definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StaticValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
}

/// A runtime value traveling through the graph during evaluation.
#[derive(Clone, Debug)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
    Field(Field),
}

impl PartialEq for StaticValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StaticValue::Float(left), StaticValue::Float(right)) => {
                left.to_bits() == right.to_bits()
            }
            (StaticValue::Int(left), StaticValue::Int(right)) => left == right,
            (StaticValue::Bool(left), StaticValue::Bool(right)) => left == right,
            (StaticValue::String(left), StaticValue::String(right)) => left == right,
            _ => false,
        }
    }
}

impl Eq for StaticValue {}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(left), Value::Float(right)) => left.to_bits() == right.to_bits(),
            (Value::Int(left), Value::Int(right)) => left == right,
            (Value::Bool(left), Value::Bool(right)) => left == right,
            (Value::String(left), Value::String(right)) => left == right,
            (Value::Field(left), Value::Field(right)) => left == right,
            _ => false,
        }
    }
}

impl StaticValue {
    pub fn data_type(&self) -> DataType {
        match self {
            StaticValue::Float(_) => DataType::Float,
            StaticValue::Int(_) => DataType::Int,
            StaticValue::Bool(_) => DataType::Bool,
            StaticValue::String(_) => DataType::String,
        }
    }
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Float(_) => DataType::Float,
            Value::Int(_) => DataType::Int,
            Value::Bool(_) => DataType::Bool,
            Value::String(_) => DataType::String,
            Value::Field(field) => field.base().clone(),
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            Value::Float(value) => *value,
            _ => panic!("Value is not a float"),
        }
    }
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(value) => *value,
            _ => panic!("Value is not an int"),
        }
    }
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(value) => *value,
            _ => panic!("Value is not a bool"),
        }
    }
    pub fn as_str(&self) -> &str {
        match self {
            Value::String(value) => value,
            _ => panic!("Value is not a string"),
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self, Value::Field(_))
    }

    pub fn as_field(&self) -> &Field {
        match self {
            Value::Field(field) => field,
            _ => panic!("Value is not a field"),
        }
    }

    /// View this value as a field. Scalars become constant fields.
    pub fn into_field(self) -> Field {
        match self {
            Value::Field(field) => field,
            scalar => Field::constant(scalar),
        }
    }
}

/// Whether a value of `from` can be converted to `to`, possibly lossily.
/// Numeric and boolean types interconvert; strings convert only to strings.
pub fn is_convertible(from: &DataType, to: &DataType) -> bool {
    if from == to {
        return true;
    }
    !matches!(from, DataType::String) && !matches!(to, DataType::String)
}

/// Convert `value` to `to`, returning `None` when the pair is unconvertible.
/// A field value converts by lifting the scalar conversion into a field
/// operation over its base type.
pub fn try_convert(value: &Value, to: &DataType) -> Option<Value> {
    if value.data_type() == *to {
        return Some(value.clone());
    }

    if let Value::Field(field) = value {
        if !is_convertible(field.base(), to) {
            return None;
        }
        return Some(Value::Field(field.clone().convert(to.clone())));
    }

    let converted = match (value, to) {
        (Value::Bool(v), DataType::Int) => Value::Int(*v as i64),
        (Value::Bool(v), DataType::Float) => Value::Float(*v as i64 as f64),

        (Value::Int(v), DataType::Bool) => Value::Bool(*v != 0),
        (Value::Int(v), DataType::Float) => Value::Float(*v as f64),

        (Value::Float(v), DataType::Bool) => Value::Bool(v.abs() > common::EPSILON),
        (Value::Float(v), DataType::Int) => Value::Int(*v as i64),

        _ => return None,
    };
    Some(converted)
}

impl From<&StaticValue> for Value {
    fn from(value: &StaticValue) -> Self {
        match value {
            StaticValue::Float(value) => Value::Float(*value),
            StaticValue::Int(value) => Value::Int(*value),
            StaticValue::Bool(value) => Value::Bool(*value),
            StaticValue::String(value) => Value::String(value.clone()),
        }
    }
}

impl From<StaticValue> for Value {
    fn from(value: StaticValue) -> Self {
        match value {
            StaticValue::Float(value) => Value::Float(value),
            StaticValue::Int(value) => Value::Int(value),
            StaticValue::Bool(value) => Value::Bool(value),
            StaticValue::String(value) => Value::String(value),
        }
    }
}

impl From<&DataType> for Value {
    fn from(data_type: &DataType) -> Self {
        match data_type {
            DataType::Float => Value::Float(0.0),
            DataType::Int => Value::Int(0),
            DataType::Bool => Value::Bool(false),
            DataType::String => Value::String("".to_string()),
        }
    }
}

impl From<&DataType> for StaticValue {
    fn from(data_type: &DataType) -> Self {
        match data_type {
            DataType::Float => StaticValue::Float(0.0),
            DataType::Int => StaticValue::Int(0),
            DataType::Bool => StaticValue::Bool(false),
            DataType::String => StaticValue::String("".to_string()),
        }
    }
}

impl From<i64> for StaticValue {
    fn from(value: i64) -> Self {
        StaticValue::Int(value)
    }
}

impl From<i32> for StaticValue {
    fn from(value: i32) -> Self {
        StaticValue::Int(value as i64)
    }
}

impl From<f64> for StaticValue {
    fn from(value: f64) -> Self {
        StaticValue::Float(value)
    }
}

impl From<bool> for StaticValue {
    fn from(value: bool) -> Self {
        StaticValue::Bool(value)
    }
}

impl From<&str> for StaticValue {
    fn from(value: &str) -> Self {
        StaticValue::String(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value as f64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::Bool => "bool",
            DataType::String => "string",
        };
        write!(f, "{}", str)
    }
}

impl FromStr for DataType {
    type Err = ();

    fn from_str(s: &str) -> Result<DataType, Self::Err> {
        match s {
            "float" | "number" => Ok(DataType::Float),
            "int" => Ok(DataType::Int),
            "bool" => Ok(DataType::Bool),
            "string" => Ok(DataType::String),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_conversions() {
        assert_eq!(
            try_convert(&Value::Int(3), &DataType::Float),
            Some(Value::Float(3.0))
        );
        assert_eq!(
            try_convert(&Value::Float(0.7), &DataType::Int),
            Some(Value::Int(0))
        );
        assert_eq!(
            try_convert(&Value::Bool(true), &DataType::Int),
            Some(Value::Int(1))
        );
        assert_eq!(
            try_convert(&Value::Int(0), &DataType::Bool),
            Some(Value::Bool(false))
        );
    }

    #[test]
    fn string_does_not_convert() {
        assert!(!is_convertible(&DataType::Int, &DataType::String));
        assert!(!is_convertible(&DataType::String, &DataType::Float));
        assert_eq!(try_convert(&Value::Int(1), &DataType::String), None);
        assert_eq!(
            try_convert(&Value::String("1".to_string()), &DataType::Int),
            None
        );
    }

    #[test]
    fn same_type_conversion_is_identity() {
        let value = Value::String("abc".to_string());
        assert_eq!(try_convert(&value, &DataType::String), Some(value));
    }

    #[test]
    fn field_conversion_lifts() {
        let field = Field::constant(Value::Int(5));
        let converted = try_convert(&Value::Field(field), &DataType::Float)
            .expect("int field should convert to float");
        let Value::Field(converted) = converted else {
            panic!("conversion of a field should produce a field");
        };
        assert_eq!(*converted.base(), DataType::Float);
        assert_eq!(converted.evaluate(), Value::Float(5.0));
    }

    #[test]
    fn default_values() {
        assert_eq!(Value::from(&DataType::Int), Value::Int(0));
        assert_eq!(Value::from(&DataType::Bool), Value::Bool(false));
        assert_eq!(Value::from(&DataType::String), Value::String("".into()));
    }
}
