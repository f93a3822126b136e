//! Data ports: the typed input/output interface of a state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a data port, unique within its owning state
pub type PortId = i64;

/// Values flowing in and out of a state, keyed by port name
pub type DataMap = BTreeMap<String, Value>;

/// Declared type of a data port.
///
/// Serialized with the lowercase names used in stored state machines
/// (`"float"`, `"int"`, ...). `Object` accepts any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int,
    Float,
    Bool,
    Str,
    List,
    Dict,
    Object,
}

impl DataType {
    /// Whether `value` can be stored in a port of this type.
    ///
    /// `null` is accepted everywhere and stands for "no value".
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (DataType::Object, _) => true,
            (DataType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (DataType::Float, Value::Number(_)) => true,
            (DataType::Bool, Value::Bool(_)) => true,
            (DataType::Str, Value::String(_)) => true,
            (DataType::List, Value::Array(_)) => true,
            (DataType::Dict, Value::Object(_)) => true,
            _ => false,
        }
    }

    /// Whether data of type `self` may flow into a port of type `target`
    pub fn flows_into(&self, target: DataType) -> bool {
        *self == target
            || target == DataType::Object
            || *self == DataType::Object
            || (*self == DataType::Int && target == DataType::Float)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::Str => "str",
            DataType::List => "list",
            DataType::Dict => "dict",
            DataType::Object => "object",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(DataType::Int),
            "float" => Ok(DataType::Float),
            "bool" => Ok(DataType::Bool),
            "str" => Ok(DataType::Str),
            "list" => Ok(DataType::List),
            "dict" => Ok(DataType::Dict),
            "object" => Ok(DataType::Object),
            other => Err(format!("unknown data type '{}'", other)),
        }
    }
}

/// Direction of a data port relative to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

impl PortDirection {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            PortDirection::Input => "input port",
            PortDirection::Output => "output port",
        }
    }
}

/// A typed, named data port owned by exactly one state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPort {
    pub data_port_id: PortId,
    pub name: String,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl DataPort {
    pub fn new(
        data_port_id: PortId,
        name: impl Into<String>,
        data_type: DataType,
        default_value: Option<Value>,
    ) -> Self {
        Self {
            data_port_id,
            name: name.into(),
            data_type,
            default_value,
        }
    }

    /// Default value, or `null` when none is declared
    pub fn default_or_null(&self) -> Value {
        self.default_value.clone().unwrap_or(Value::Null)
    }
}
