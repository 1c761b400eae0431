//! Cell protocol
//!
//! Cells are newline-delimited JSON objects discriminated by a `"type"`
//! field. Binary fields (wrapped keys, handshake values, ciphertexts, IVs)
//! travel as standard base64 strings and circuit ids as decimal strings.
//!
//! A line is parsed exactly once, at the protocol boundary, into the
//! [`Cell`] sum type. Everything past that point matches exhaustively.

use super::crypto::{self, Iv, SymmetricKey};
use super::router::Route;
use super::serde_helpers::{base64_bytes, base64_iv, lenient_base64_bytes, optional_circ_id};
use crate::error::{OnionError, Result};
use rand::Rng;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Circuit identifier
///
/// Only meaningful relative to the relay (or client) that holds it: each
/// relay mints its own identifiers for the downstream segments it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircId(u32);

impl CircId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Pick a random identifier
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CircId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CircId {
    type Err = OnionError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u32>()
            .map(CircId)
            .map_err(|_| OnionError::MalformedCell(format!("invalid circuit id: {:?}", s)))
    }
}

impl Serialize for CircId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CircId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Accept both "42" and 42
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u32),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Raw::Number(id) => Ok(CircId(id)),
        }
    }
}

/// CREATE: start a handshake with the receiving relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCell {
    #[serde(rename = "circID")]
    pub circ_id: CircId,
    /// `key:iv` wrapped for the relay's long-term key
    #[serde(with = "lenient_base64_bytes")]
    pub encrypted_sym_key: Vec<u8>,
    /// AES-CBC encrypted handshake public value
    #[serde(rename = "gX", with = "lenient_base64_bytes")]
    pub g_x: Vec<u8>,
    /// Where the Created reply must be sent
    pub src_addr: String,
    pub src_port: u16,
}

impl CreateCell {
    pub fn source(&self) -> Route {
        Route::new(self.src_addr.clone(), self.src_port)
    }
}

/// CREATED: handshake reply
///
/// All fields are empty when the relay could not decrypt the Create.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreatedCell {
    #[serde(rename = "circID", with = "optional_circ_id", default)]
    pub circ_id: Option<CircId>,
    #[serde(rename = "gY", with = "base64_bytes", default)]
    pub g_y: Vec<u8>,
    #[serde(rename = "kHash", with = "base64_bytes", default)]
    pub k_hash: Vec<u8>,
}

impl CreatedCell {
    /// The fail-open acknowledgment for an undecryptable Create
    pub fn failed() -> Self {
        Self::default()
    }

    pub fn is_failure(&self) -> bool {
        self.circ_id.is_none() && self.g_y.is_empty() && self.k_hash.is_empty()
    }
}

/// RELAY: one onion layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCell {
    #[serde(rename = "circID")]
    pub circ_id: CircId,
    #[serde(with = "base64_iv")]
    pub iv: Iv,
    /// AES-CBC encrypted [`RelaySecret`]
    #[serde(with = "base64_bytes")]
    pub relay_secret: Vec<u8>,
}

impl RelayCell {
    /// Encrypt `secret` under `key` with the given IV
    pub fn seal(circ_id: CircId, secret: &RelaySecret, key: &SymmetricKey, iv: Iv) -> Result<Self> {
        let plaintext = serde_json::to_vec(secret)
            .map_err(|e| OnionError::Internal(format!("Relay secret serialization failed: {}", e)))?;
        Ok(Self {
            circ_id,
            iv,
            relay_secret: crypto::encrypt_symmetric(&plaintext, key, &iv),
        })
    }

    /// Decrypt this layer with `key` and the IV carried in the cell
    pub fn open(&self, key: &SymmetricKey) -> Result<RelaySecret> {
        let plaintext = crypto::decrypt_cbc(&self.relay_secret, key, &self.iv)?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            OnionError::MalformedCell(format!("relay secret on circuit {}: {}", self.circ_id, e))
        })
    }
}

/// DESTROY: tear down a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyCell {
    #[serde(rename = "circID")]
    pub circ_id: CircId,
}

/// EXTEND: ask a relay to run the Create handshake with the next hop itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendCell {
    #[serde(rename = "circID")]
    pub circ_id: CircId,
    pub addr: String,
    pub port: u16,
    #[serde(with = "base64_bytes")]
    pub encrypted_sym_key: Vec<u8>,
    #[serde(rename = "gX", with = "base64_bytes")]
    pub g_x: Vec<u8>,
}

impl ExtendCell {
    pub fn target(&self) -> Route {
        Route::new(self.addr.clone(), self.port)
    }
}

/// EXTENDED: the next hop's Created, relabelled for the inbound circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedCell {
    #[serde(rename = "circID")]
    pub circ_id: CircId,
    #[serde(rename = "gY", with = "base64_bytes")]
    pub g_y: Vec<u8>,
    #[serde(rename = "kHash", with = "base64_bytes")]
    pub k_hash: Vec<u8>,
}

/// DATA: application payload for the exit hop to deliver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCell {
    pub server_addr: String,
    pub server_port: u16,
    /// Opaque to the overlay, sent to the server as one JSON line
    pub child: serde_json::Value,
}

impl DataCell {
    pub fn server(&self) -> Route {
        Route::new(self.server_addr.clone(), self.server_port)
    }
}

/// A wire cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Cell {
    Create(CreateCell),
    Created(CreatedCell),
    Relay(RelayCell),
    Destroy(DestroyCell),
    Extend(ExtendCell),
    Extended(ExtendedCell),
    Data(DataCell),
}

impl Cell {
    /// Every `type` tag this codec understands
    pub const TYPES: [&'static str; 7] = [
        "CREATE", "CREATED", "RELAY", "DESTROY", "EXTEND", "EXTENDED", "DATA",
    ];

    /// Parse one line of input
    ///
    /// Distinguishes a missing `type`, an unknown `type` and a malformed body
    /// so callers can log precisely what was dropped.
    pub fn from_line(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line.trim())?;
        Self::from_value(value)
    }

    /// Parse an already-decoded JSON object
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let tag = match value.get("type") {
            None => return Err(OnionError::MissingCellType),
            Some(serde_json::Value::String(tag)) => tag.clone(),
            Some(other) => {
                return Err(OnionError::MalformedCell(format!("type is not a string: {}", other)))
            }
        };
        if !Self::TYPES.contains(&tag.as_str()) {
            return Err(OnionError::UnknownCellType(tag));
        }
        serde_json::from_value(value)
            .map_err(|e| OnionError::MalformedCell(format!("{} cell: {}", tag, e)))
    }

    /// Serialize to a single line (without the trailing newline)
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| OnionError::Internal(format!("Cell serialization failed: {}", e)))
    }

    /// The wire `type` tag
    pub fn type_name(&self) -> &'static str {
        match self {
            Cell::Create(_) => "CREATE",
            Cell::Created(_) => "CREATED",
            Cell::Relay(_) => "RELAY",
            Cell::Destroy(_) => "DESTROY",
            Cell::Extend(_) => "EXTEND",
            Cell::Extended(_) => "EXTENDED",
            Cell::Data(_) => "DATA",
        }
    }

    /// Circuit id carried by the cell, if any
    pub fn circ_id(&self) -> Option<CircId> {
        match self {
            Cell::Create(c) => Some(c.circ_id),
            Cell::Created(c) => c.circ_id,
            Cell::Relay(c) => Some(c.circ_id),
            Cell::Destroy(c) => Some(c.circ_id),
            Cell::Extend(c) => Some(c.circ_id),
            Cell::Extended(c) => Some(c.circ_id),
            Cell::Data(_) => None,
        }
    }

    /// Short description for logs: `TYPE#circ`
    pub fn describe(&self) -> String {
        match self.circ_id() {
            Some(id) => format!("{}#{}", self.type_name(), id),
            None => self.type_name().to_string(),
        }
    }
}

/// What an onion layer carries: either another cell or an opaque reply
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Cell(Cell),
    Opaque(serde_json::Value),
}

impl From<Cell> for Payload {
    fn from(cell: Cell) -> Self {
        Payload::Cell(cell)
    }
}

/// Plaintext of a Relay cell: where to send `child` next
///
/// `childKind` (`"cell"` or `"opaque"`) says how to read `child`, so a
/// destination reply that happens to look like a cell stays opaque.
/// On the return path the destination is empty (`""`, port 0) since the
/// relay holding the key already knows where return traffic goes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireSecret")]
pub struct RelaySecret {
    pub addr: String,
    pub port: u16,
    pub child: Payload,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum ChildKind {
    Cell,
    Opaque,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSecret {
    addr: String,
    port: u16,
    child_kind: ChildKind,
    child: serde_json::Value,
}

impl TryFrom<WireSecret> for RelaySecret {
    type Error = OnionError;

    fn try_from(wire: WireSecret) -> Result<Self> {
        let child = match wire.child_kind {
            ChildKind::Cell => Payload::Cell(Cell::from_value(wire.child)?),
            ChildKind::Opaque => Payload::Opaque(wire.child),
        };
        Ok(Self {
            addr: wire.addr,
            port: wire.port,
            child,
        })
    }
}

impl Serialize for RelaySecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut secret = serializer.serialize_struct("RelaySecret", 4)?;
        secret.serialize_field("addr", &self.addr)?;
        secret.serialize_field("port", &self.port)?;
        match &self.child {
            Payload::Cell(cell) => {
                secret.serialize_field("childKind", "cell")?;
                secret.serialize_field("child", cell)?;
            }
            Payload::Opaque(value) => {
                secret.serialize_field("childKind", "opaque")?;
                secret.serialize_field("child", value)?;
            }
        }
        secret.end()
    }
}

impl RelaySecret {
    pub fn forward(dest: &Route, child: impl Into<Payload>) -> Self {
        Self {
            addr: dest.addr.clone(),
            port: dest.port,
            child: child.into(),
        }
    }

    /// A return-path secret with no destination
    pub fn backward(child: impl Into<Payload>) -> Self {
        Self {
            addr: String::new(),
            port: 0,
            child: child.into(),
        }
    }

    pub fn destination(&self) -> Route {
        Route::new(self.addr.clone(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_create() -> Cell {
        Cell::Create(CreateCell {
            circ_id: CircId::new(3_000_000_001),
            encrypted_sym_key: vec![1, 2, 3],
            g_x: vec![4, 5, 6, 7],
            src_addr: "127.0.0.1".into(),
            src_port: 9000,
        })
    }

    #[test]
    fn test_create_wire_shape() {
        let line = sample_create().to_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["type"], "CREATE");
        assert_eq!(value["circID"], "3000000001");
        assert_eq!(value["encryptedSymKey"], "AQID");
        assert_eq!(value["gX"], "BAUGBw==");
        assert_eq!(value["srcAddr"], "127.0.0.1");
        assert_eq!(value["srcPort"], 9000);
        assert!(!line.contains('\n'));

        assert_eq!(Cell::from_line(&line).unwrap(), sample_create());
    }

    #[test]
    fn test_failed_created_has_empty_fields() {
        let line = Cell::Created(CreatedCell::failed()).to_line().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["circID"], "");
        assert_eq!(value["gY"], "");
        assert_eq!(value["kHash"], "");

        match Cell::from_line(&line).unwrap() {
            Cell::Created(created) => assert!(created.is_failure()),
            other => panic!("expected CREATED, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_and_unknown_type() {
        assert!(matches!(
            Cell::from_line(r#"{"circID":"1"}"#),
            Err(OnionError::MissingCellType)
        ));
        assert!(matches!(
            Cell::from_line(r#"{"type":"PING","circID":"1"}"#),
            Err(OnionError::UnknownCellType(t)) if t == "PING"
        ));
        assert!(matches!(
            Cell::from_line(r#"{"type":7}"#),
            Err(OnionError::MalformedCell(_))
        ));
        assert!(matches!(
            Cell::from_line(r#"{"type":"DESTROY"}"#),
            Err(OnionError::MalformedCell(_))
        ));
        assert!(Cell::from_line("not json at all").unwrap_err().is_malformed());
    }

    #[test]
    fn test_circ_id_accepts_numbers() {
        let cell = Cell::from_line(r#"{"type":"DESTROY","circID":42}"#).unwrap();
        assert_eq!(cell.circ_id(), Some(CircId::new(42)));
        assert_eq!(cell.describe(), "DESTROY#42");
        assert!("-1".parse::<CircId>().is_err());
    }

    #[test]
    fn test_relay_seal_open() {
        let key = SymmetricKey::generate();
        let secret = RelaySecret::forward(&Route::new("10.0.0.2", 7001), sample_create());
        let relay = RelayCell::seal(CircId::new(9), &secret, &key, crypto::random_iv()).unwrap();

        let line = Cell::Relay(relay.clone()).to_line().unwrap();
        let parsed = match Cell::from_line(&line).unwrap() {
            Cell::Relay(r) => r,
            other => panic!("expected RELAY, got {:?}", other),
        };
        assert_eq!(parsed, relay);
        assert_eq!(parsed.open(&key).unwrap(), secret);
        assert!(parsed.open(&SymmetricKey::generate()).is_err());
    }

    #[test]
    fn test_child_kind_is_explicit() {
        let forward = RelaySecret::forward(
            &Route::new("10.0.0.3", 7002),
            Cell::Destroy(DestroyCell { circ_id: CircId::new(5) }),
        );
        let value = serde_json::to_value(&forward).unwrap();
        assert_eq!(value["childKind"], "cell");
        assert_eq!(value["child"]["type"], "DESTROY");
        assert_eq!(serde_json::from_value::<RelaySecret>(value).unwrap(), forward);

        // A destination reply shaped like a cell is still opaque
        let reply = json!({"type": "DESTROY", "circID": 5});
        let backward = RelaySecret::backward(Payload::Opaque(reply.clone()));
        let value = serde_json::to_value(&backward).unwrap();
        assert_eq!(value["addr"], "");
        assert_eq!(value["port"], 0);
        assert_eq!(value["childKind"], "opaque");
        let parsed: RelaySecret = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.child, Payload::Opaque(reply));

        let bad_cell = json!({"addr": "", "port": 0, "childKind": "cell", "child": {"status": "ok"}});
        assert!(serde_json::from_value::<RelaySecret>(bad_cell).is_err());
        let untagged = json!({"addr": "", "port": 0, "child": {"status": "ok"}});
        assert!(serde_json::from_value::<RelaySecret>(untagged).is_err());
    }

    #[test]
    fn test_data_cell_child_is_opaque() {
        let line = r#"{"type":"DATA","serverAddr":"127.0.0.1","serverPort":8080,"child":{"type":"anything","n":1}}"#;
        match Cell::from_line(line).unwrap() {
            Cell::Data(data) => {
                assert_eq!(data.server(), Route::new("127.0.0.1", 8080));
                assert_eq!(data.child["n"], 1);
            }
            other => panic!("expected DATA, got {:?}", other),
        }
    }
}
