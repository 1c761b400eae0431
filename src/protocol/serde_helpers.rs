// Serialization helpers for wire cells

/// Binary blobs travel as standard base64 strings.
///
/// An empty string decodes to an empty buffer, which is how a failed
/// handshake is acknowledged on the wire.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Like [`base64_bytes`], but undecodable text becomes an empty buffer.
///
/// Used for the Create cell's encrypted blobs: bad encoding must surface
/// as a failed decryption, which the relay acknowledges with an empty
/// CREATED, rather than as an unparseable cell.
pub mod lenient_base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer};

    pub use super::base64_bytes::serialize;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Ok(STANDARD.decode(encoded.as_bytes()).unwrap_or_else(|e| {
            log::debug!("Undecodable base64 blob ({}), treating as empty", e);
            Vec::new()
        }))
    }
}

/// Fixed 16-byte IV as base64.
pub mod base64_iv {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::protocol::crypto::IV_LEN;

    pub fn serialize<S>(iv: &[u8; IV_LEN], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(iv))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; IV_LEN], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let raw = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        raw.try_into().map_err(|raw: Vec<u8>| {
            serde::de::Error::custom(format!("IV must be {} bytes, got {}", IV_LEN, raw.len()))
        })
    }
}

/// Optional circuit id, written as `""` when absent.
pub mod optional_circ_id {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::protocol::CircId;

    pub fn serialize<S>(id: &Option<CircId>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match id {
            Some(id) => id.serialize(serializer),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<CircId>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<u32>()
            .map(|id| Some(CircId::new(id)))
            .map_err(serde::de::Error::custom)
    }
}
