use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

/// Deserializes a numeric field the API may send either as a bare number or
/// as a decimal string (`"results": "1234"`).
pub(crate) fn stringified<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Value(T),
        Text(String),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Value(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Data {
        #[serde(deserialize_with = "super::stringified")]
        value: i64,
    }

    #[test]
    fn from_string() {
        let data: Data = serde_json::from_value(json!({ "value": "123" })).unwrap();
        assert_eq!(data.value, 123);
    }

    #[test]
    fn from_number() {
        let data: Data = serde_json::from_value(json!({ "value": 123 })).unwrap();
        assert_eq!(data.value, 123);
    }

    #[test]
    fn from_garbage() {
        assert!(serde_json::from_value::<Data>(json!({ "value": "abc" })).is_err());
    }
}
