//! Serializers for stored state machine files

use crate::error::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Protocol for turning descriptors into file contents and back
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// Pretty-printed JSON (default)
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// YAML, for hand-edited state machines
#[derive(Debug, Clone, Default)]
pub struct YamlSerializer;

impl YamlSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for YamlSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(value)?.into_bytes())
    }

    fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_yaml::from_slice(data)?)
    }
}

/// On-disk format of a stored state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    #[default]
    Json,
    Yaml,
}

impl StorageFormat {
    pub const ALL: [StorageFormat; 2] = [StorageFormat::Json, StorageFormat::Yaml];

    /// File extension, without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            StorageFormat::Json => "json",
            StorageFormat::Yaml => "yaml",
        }
    }

    pub(crate) fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            StorageFormat::Json => JsonSerializer.dumps(value),
            StorageFormat::Yaml => YamlSerializer.dumps(value),
        }
    }

    pub(crate) fn loads<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            StorageFormat::Json => JsonSerializer.loads(data),
            StorageFormat::Yaml => YamlSerializer.loads(data),
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        value: i32,
    }

    fn data() -> TestData {
        TestData {
            name: "test".to_string(),
            value: 42,
        }
    }

    #[test]
    fn test_json_serializer() {
        let serializer = JsonSerializer::new();
        let bytes = serializer.dumps(&data()).unwrap();
        let restored: TestData = serializer.loads(&bytes).unwrap();
        assert_eq!(restored, data());
        assert!(String::from_utf8(bytes).unwrap().contains("\"name\": \"test\""));
    }

    #[test]
    fn test_yaml_serializer() {
        let serializer = YamlSerializer::new();
        let bytes = serializer.dumps(&data()).unwrap();
        assert!(String::from_utf8(bytes.clone()).unwrap().contains("name: test"));
        let restored: TestData = serializer.loads(&bytes).unwrap();
        assert_eq!(restored, data());
    }

    #[test]
    fn test_format_rejects_garbage() {
        for format in StorageFormat::ALL {
            let result: Result<TestData> = format.loads(b"[not, a, struct");
            assert!(result.is_err(), "{} accepted garbage", format);
        }
    }
}
