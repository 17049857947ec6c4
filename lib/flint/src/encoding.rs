/// Serde adaptors for byte arrays carried as base64 text in config files.
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&::base64::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ::base64::decode(&s).map_err(de::Error::custom)
    }

    pub fn encode(bytes: &[u8]) -> String {
        ::base64::encode(bytes)
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(s)
    }
}
