//! Tensor element datatypes exchanged with the serving host

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Element datatype of a host tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Uint8,
    Uint32,
    Uint64,
    Int8,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
}

impl DataType {
    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            DataType::Bool | DataType::Uint8 | DataType::Int8 => 1,
            DataType::Fp16 => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Fp32 => 4,
            DataType::Uint64 | DataType::Int64 | DataType::Fp64 => 8,
        }
    }

    /// Parse from the declaration form (`TYPE_FP32`); the bare form (`FP32`) is accepted too
    pub fn from_str(s: &str) -> Option<Self> {
        let bare = s.strip_prefix("TYPE_").unwrap_or(s);
        match bare {
            "BOOL" => Some(DataType::Bool),
            "UINT8" => Some(DataType::Uint8),
            "UINT32" => Some(DataType::Uint32),
            "UINT64" => Some(DataType::Uint64),
            "INT8" => Some(DataType::Int8),
            "INT32" => Some(DataType::Int32),
            "INT64" => Some(DataType::Int64),
            "FP16" => Some(DataType::Fp16),
            "FP32" => Some(DataType::Fp32),
            "FP64" => Some(DataType::Fp64),
            _ => None,
        }
    }

    /// Convert to the declaration form
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "TYPE_BOOL",
            DataType::Uint8 => "TYPE_UINT8",
            DataType::Uint32 => "TYPE_UINT32",
            DataType::Uint64 => "TYPE_UINT64",
            DataType::Int8 => "TYPE_INT8",
            DataType::Int32 => "TYPE_INT32",
            DataType::Int64 => "TYPE_INT64",
            DataType::Fp16 => "TYPE_FP16",
            DataType::Fp32 => "TYPE_FP32",
            DataType::Fp64 => "TYPE_FP64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DataType::from_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown datatype: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_both_forms() {
        assert_eq!(DataType::from_str("TYPE_FP32"), Some(DataType::Fp32));
        assert_eq!(DataType::from_str("INT64"), Some(DataType::Int64));
        assert_eq!(DataType::from_str("TYPE_STRING"), None);
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let dtype: DataType = serde_yaml::from_str("TYPE_UINT32").unwrap();
        assert_eq!(dtype, DataType::Uint32);
        assert_eq!(dtype.size(), 4);
    }
}
