//! Authorized-gateway configuration.
//!
//! Loaded once at startup; the resulting table is read-only. Any schema
//! violation is a fatal startup error, never a runtime one.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::protocol::{GatewayUid, Key};

/// On-disk schema. Unknown keys are ignored.
///
/// ```json
/// { "authorized_gateways": [ { "uid": "aabbccdd", "key": "<64 hex chars>" } ] }
/// ```
#[derive(Debug, Deserialize)]
struct ConfigFile {
    authorized_gateways: Vec<GatewayEntry>,
}

#[derive(Debug, Deserialize)]
struct GatewayEntry {
    uid: String,
    key: String,
}

/// The read-only authorization table: gateway UID to 256-bit key.
#[derive(Debug, Clone)]
pub struct GatewayTable {
    entries: HashMap<GatewayUid, Key>,
}

impl GatewayTable {
    /// Load and validate the table from a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        let file: ConfigFile =
            serde_json::from_str(content).context("failed to parse config JSON")?;

        let mut entries = HashMap::with_capacity(file.authorized_gateways.len());
        for entry in &file.authorized_gateways {
            let uid = GatewayUid(
                decode_hex::<4>(&entry.uid)
                    .with_context(|| format!("bad gateway uid {:?}", entry.uid))?,
            );
            let key = decode_hex::<32>(&entry.key)
                .with_context(|| format!("bad key for gateway {}", uid))?;
            if entries.insert(uid, key).is_some() {
                bail!("duplicate gateway uid {}", uid);
            }
        }
        Ok(GatewayTable { entries })
    }

    /// Build a table directly from UID/key pairs (embedding and tests).
    pub fn from_pairs(pairs: impl IntoIterator<Item = (GatewayUid, Key)>) -> Self {
        GatewayTable {
            entries: pairs.into_iter().collect(),
        }
    }

    pub fn key_for(&self, uid: &GatewayUid) -> Option<&Key> {
        self.entries.get(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decode exactly `N` bytes of hex, ignoring embedded whitespace.
fn decode_hex<const N: usize>(input: &str) -> Result<[u8; N]> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() != N * 2 {
        bail!("expected {} hex characters, got {}", N * 2, cleaned.len());
    }

    let mut out = [0u8; N];
    for (i, chunk) in cleaned.as_bytes().chunks_exact(2).enumerate() {
        let pair = std::str::from_utf8(chunk).context("non-ASCII in hex string")?;
        out[i] = u8::from_str_radix(pair, 16)
            .with_context(|| format!("invalid hex pair {:?}", pair))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let table = GatewayTable::parse(
            r#"{
                "authorized_gateways": [
                    { "uid": "aabbccdd", "key": "1111111111111111111111111111111111111111111111111111111111111111" },
                    { "uid": "00000002", "key": "2222222222222222222222222222222222222222222222222222222222222222" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(table.len(), 2);
        let key = table.key_for(&GatewayUid([0xAA, 0xBB, 0xCC, 0xDD])).unwrap();
        assert_eq!(key, &[0x11; 32]);
        assert!(table.key_for(&GatewayUid([0, 0, 0, 1])).is_none());
    }

    #[test]
    fn test_hex_whitespace_stripped() {
        let table = GatewayTable::parse(
            r#"{
                "authorized_gateways": [
                    { "uid": "aa bb cc dd", "key": "11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11 11" }
                ]
            }"#,
        )
        .unwrap();
        assert!(table.key_for(&GatewayUid([0xAA, 0xBB, 0xCC, 0xDD])).is_some());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let table = GatewayTable::parse(
            r#"{
                "server_name": "plant-7",
                "authorized_gateways": [
                    { "uid": "01020304", "key": "1111111111111111111111111111111111111111111111111111111111111111", "label": "press" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_wrong_uid_length_rejected() {
        let err = GatewayTable::parse(
            r#"{ "authorized_gateways": [ { "uid": "aabbcc", "key": "1111111111111111111111111111111111111111111111111111111111111111" } ] }"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("bad gateway uid"));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let err = GatewayTable::parse(
            r#"{ "authorized_gateways": [ { "uid": "aabbccdd", "key": "1111" } ] }"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("bad key"));
    }

    #[test]
    fn test_non_hex_rejected() {
        let err = GatewayTable::parse(
            r#"{ "authorized_gateways": [ { "uid": "zzbbccdd", "key": "1111111111111111111111111111111111111111111111111111111111111111" } ] }"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("bad gateway uid"));
    }

    #[test]
    fn test_duplicate_uid_rejected() {
        let err = GatewayTable::parse(
            r#"{
                "authorized_gateways": [
                    { "uid": "aabbccdd", "key": "1111111111111111111111111111111111111111111111111111111111111111" },
                    { "uid": "aabbccdd", "key": "2222222222222222222222222222222222222222222222222222222222222222" }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate gateway uid"));
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(GatewayTable::load(Path::new("/nonexistent/ssgs.json")).is_err());
    }

    #[test]
    fn test_decode_hex_exact_width() {
        assert_eq!(decode_hex::<2>("0aFF").unwrap(), [0x0A, 0xFF]);
        assert!(decode_hex::<2>("0aFF00").is_err());
        assert!(decode_hex::<2>("0a").is_err());
    }
}
