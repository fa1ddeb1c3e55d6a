//! Message codecs: typed values to and from broker payloads.

use crate::error::{BrokerError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

/// Converts a message into a payload
pub trait MessageSerializer<T>: Send + Sync {
    fn serialize(&self, message: &T) -> Result<Vec<u8>>;
}

/// Converts a payload back into a message
pub trait MessageDeserializer<T>: Send + Sync {
    fn deserialize(&self, data: &[u8]) -> Result<T>;
}

/// JSON serializer
#[derive(Debug)]
pub struct JsonMessageSerializer<T>(PhantomData<fn(&T)>);

impl<T> JsonMessageSerializer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonMessageSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> MessageSerializer<T> for JsonMessageSerializer<T> {
    fn serialize(&self, message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| BrokerError::Serialization(e.to_string()))
    }
}

/// JSON deserializer
#[derive(Debug)]
pub struct JsonMessageDeserializer<T>(PhantomData<fn() -> T>);

impl<T> JsonMessageDeserializer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonMessageDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> MessageDeserializer<T> for JsonMessageDeserializer<T> {
    fn deserialize(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| BrokerError::Deserialization(e.to_string()))
    }
}

/// Compact binary serializer
#[derive(Debug)]
pub struct BincodeMessageSerializer<T>(PhantomData<fn(&T)>);

impl<T> BincodeMessageSerializer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeMessageSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> MessageSerializer<T> for BincodeMessageSerializer<T> {
    fn serialize(&self, message: &T) -> Result<Vec<u8>> {
        bincode::serialize(message).map_err(|e| BrokerError::Serialization(e.to_string()))
    }
}

/// Compact binary deserializer
#[derive(Debug)]
pub struct BincodeMessageDeserializer<T>(PhantomData<fn() -> T>);

impl<T> BincodeMessageDeserializer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeMessageDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> MessageDeserializer<T> for BincodeMessageDeserializer<T> {
    fn deserialize(&self, data: &[u8]) -> Result<T> {
        bincode::deserialize(data).map_err(|e| BrokerError::Deserialization(e.to_string()))
    }
}

/// UTF-8 text serializer
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl MessageSerializer<String> for StringSerializer {
    fn serialize(&self, message: &String) -> Result<Vec<u8>> {
        Ok(message.as_bytes().to_vec())
    }
}

/// UTF-8 text deserializer
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStringDeserializer;

impl MessageDeserializer<String> for DefaultStringDeserializer {
    fn deserialize(&self, data: &[u8]) -> Result<String> {
        String::from_utf8(data.to_vec()).map_err(|e| BrokerError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        amount_cents: u64,
    }

    #[test]
    fn test_json_codec() {
        let message = OrderPlaced {
            order_id: "ord-1".to_string(),
            amount_cents: 1299,
        };
        let payload = JsonMessageSerializer::new().serialize(&message).unwrap();
        assert_eq!(payload, br#"{"order_id":"ord-1","amount_cents":1299}"#.to_vec());

        let decoded: OrderPlaced = JsonMessageDeserializer::new().deserialize(&payload).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_json_malformed_is_deserialization_error() {
        let result: Result<OrderPlaced> = JsonMessageDeserializer::new().deserialize(b"{not json");
        assert!(matches!(result, Err(BrokerError::Deserialization(_))));
    }

    #[test]
    fn test_json_non_serializable_is_serialization_error() {
        // JSON object keys must be strings
        let mut map = BTreeMap::new();
        map.insert(vec![1u8, 2], "value".to_string());
        let result = JsonMessageSerializer::new().serialize(&map);
        assert!(matches!(result, Err(BrokerError::Serialization(_))));
    }

    #[test]
    fn test_bincode_is_more_compact_than_json() {
        let message = OrderPlaced {
            order_id: "ord-2".to_string(),
            amount_cents: 42,
        };
        let binary = BincodeMessageSerializer::new().serialize(&message).unwrap();
        let json = JsonMessageSerializer::new().serialize(&message).unwrap();
        assert!(binary.len() < json.len());

        let decoded: OrderPlaced = BincodeMessageDeserializer::new().deserialize(&binary).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_string_codec_rejects_invalid_utf8() {
        assert_eq!(
            DefaultStringDeserializer.deserialize(b"hello").unwrap(),
            "hello".to_string()
        );
        assert!(matches!(
            DefaultStringDeserializer.deserialize(&[0xff, 0xfe]),
            Err(BrokerError::Deserialization(_))
        ));
        assert_eq!(
            StringSerializer.serialize(&"hi".to_string()).unwrap(),
            b"hi".to_vec()
        );
    }
}
