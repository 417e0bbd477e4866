
use anyhow::Result;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const WS_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

const MAGIC0: u8 = b'S';
const MAGIC1: u8 = b'B';
const VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Json,
    MsgPack,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::MsgPack => "msgpack",
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Encoding::Json => 0,
            Encoding::MsgPack => 1,
        }
    }
}

pub fn preferred_encoding(header: &str) -> Encoding {
    match header.trim().to_lowercase().as_str() {
        "msgpack" => Encoding::MsgPack,
        "json" => Encoding::Json,
        _ => Encoding::Json,
    }
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "typ")]
    pub typ: u16,
    #[serde(rename = "dat")]
    pub dat: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct FileWrite {
    pub path: String,
    pub etag: String,
    pub length: i64,
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct JsonFileWrite {
    #[serde(rename = "pth")]
    pub path: String,
    #[serde(rename = "etg")]
    pub etag: String,
    #[serde(rename = "len")]
    pub length: i64,
    #[serde(rename = "con", default, deserialize_with = "deserialize_base64_opt")]
    pub content: Option<Vec<u8>>,
}

// Go msgpack encoding uses exported field names, not `json:"pth"` tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackFileWrite {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Length")]
    pub length: i64,
    #[serde(rename = "Content", default)]
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub original_id: String,
}

#[derive(Debug, Clone)]
pub struct Nack {
    pub original_id: String,
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct JsonAck {
    #[serde(rename = "oid")]
    pub original_id: String,
}

#[derive(Debug, Deserialize)]
struct JsonNack {
    #[serde(rename = "oid")]
    pub original_id: String,
    #[serde(rename = "err")]
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct MsgpackAck {
    #[serde(rename = "OriginalId")]
    pub original_id: String,
}

#[derive(Debug, Deserialize)]
struct MsgpackNack {
    #[serde(rename = "OriginalId")]
    pub original_id: String,
    #[serde(rename = "Error")]
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct HttpMsg {
    pub syft_url: String,
    pub id: String,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct JsonHttpMsg {
    #[serde(rename = "syft_url")]
    pub syft_url: String,
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_base64_opt")]
    pub body: Option<Vec<u8>>,
}

// Go msgpack encoding uses exported field names and nested SyftURL struct.
#[derive(Debug, Deserialize)]
struct MsgpackSyftURL {
    #[serde(rename = "Datasite")]
    datasite: String,
    #[serde(rename = "AppName")]
    app_name: String,
    #[serde(rename = "Endpoint")]
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct MsgpackHttpMsg {
    #[serde(rename = "SyftURL")]
    syft_url: MsgpackSyftURL,
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Body", default)]
    body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct FileDelete {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ErrorMsg {
    pub code: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct JsonFileDelete {
    #[serde(rename = "pth")]
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct MsgpackFileDelete {
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct JsonErrorMsg {
    #[serde(rename = "cod")]
    pub code: String,
    #[serde(rename = "pth", default)]
    pub path: String,
    #[serde(rename = "msg", default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct MsgpackErrorMsg {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Path", default)]
    pub path: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

#[derive(Debug)]
pub enum Decoded {
    FileWrite(FileWrite),
    FileDelete(FileDelete),
    Http(HttpMsg),
    Ack(Ack),
    Nack(Nack),
    Error(ErrorMsg),
    AclManifest(crate::model::ACLManifest),
    System,
    Other { id: String, typ: u16 },
}

/// Wire type codes. `FileWrite` (2) carries content; the same type with an
/// empty/absent content field is a push-only `FileNotify` (§6.1) and decodes
/// to the same `Decoded::FileWrite` variant with `content: None` — callers
/// distinguish a notify by checking `content.is_none()`.
mod typ {
    pub const SYSTEM: u16 = 1;
    pub const FILE_WRITE: u16 = 2;
    pub const FILE_DELETE: u16 = 3;
    pub const ACK: u16 = 4;
    pub const NACK: u16 = 5;
    pub const HTTP: u16 = 6;
    pub const FILE_NOTIFY: u16 = 7;
    pub const ERROR: u16 = 8;
    pub const ACL_MANIFEST: u16 = 9;
}

#[derive(Debug, Deserialize, Serialize)]
struct WireMessage {
    pub id: String,
    #[serde(rename = "typ")]
    pub typ: u16,
    #[serde(rename = "dat")]
    pub dat: Vec<u8>,
}

/// Encodes a `FileWrite` for the priority-upload send path (§4.6 step 4).
pub fn encode_file_write(id: &str, path: &str, etag: &str, length: i64, content: Vec<u8>) -> Result<Vec<u8>> {
    encode_msgpack(
        id,
        typ::FILE_WRITE,
        &MsgpackFileWrite {
            path: path.to_string(),
            etag: etag.to_string(),
            length,
            content: Some(content),
        },
    )
}

pub fn encode_msgpack<T: Serialize>(id: &str, typ: u16, dat: &T) -> Result<Vec<u8>> {
    let dat_bytes = rmp_serde::to_vec_named(dat)?;
    let wire = WireMessage {
        id: id.to_string(),
        typ,
        dat: dat_bytes,
    };
    let payload = rmp_serde::to_vec_named(&wire)?;

    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(MAGIC0);
    out.push(MAGIC1);
    out.push(VERSION);
    out.push(Encoding::MsgPack.as_byte());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_text_json(raw: &str) -> Result<Decoded> {
    let msg: Message = serde_json::from_str(raw)?;
    decode_json_msg(msg)
}

pub fn decode_binary(raw: &[u8]) -> Result<Decoded> {
    if raw.len() >= 4 && raw[0] == MAGIC0 && raw[1] == MAGIC1 {
        if raw[2] != VERSION {
            anyhow::bail!("unsupported ws envelope version: {}", raw[2]);
        }
        let enc = raw[3];
        let payload = &raw[4..];
        match enc {
            1 => decode_msgpack(payload),
            0 => {
                // Allow binary JSON envelopes if ever used.
                let txt = std::str::from_utf8(payload)?;
                decode_text_json(txt)
            }
            _ => anyhow::bail!("unknown ws encoding: {}", enc),
        }
    } else {
        // Legacy binary frames are treated as UTF-8 JSON (best effort).
        let txt = std::str::from_utf8(raw)?;
        decode_text_json(txt)
    }
}

fn decode_msgpack(payload: &[u8]) -> Result<Decoded> {
    let wire: WireMessage = rmp_serde::from_slice(payload)?;
    decode_wire(wire)
}

fn decode_wire(wire: WireMessage) -> Result<Decoded> {
    match wire.typ {
        typ::FILE_WRITE | typ::FILE_NOTIFY => {
            let fw: MsgpackFileWrite = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::FileWrite(FileWrite {
                path: fw.path,
                etag: fw.etag,
                length: fw.length,
                content: fw.content,
            }))
        }
        typ::FILE_DELETE => {
            let fd: MsgpackFileDelete = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::FileDelete(FileDelete { path: fd.path }))
        }
        typ::HTTP => {
            let hm: MsgpackHttpMsg = rmp_serde::from_slice(&wire.dat)?;
            let syft_url = format!(
                "syft://{}/{}/{}",
                hm.syft_url.datasite, hm.syft_url.app_name, hm.syft_url.endpoint
            );
            Ok(Decoded::Http(HttpMsg {
                syft_url,
                id: hm.id,
                body: hm.body,
            }))
        }
        typ::ACK => {
            let ack: MsgpackAck = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::Ack(Ack {
                original_id: ack.original_id,
            }))
        }
        typ::NACK => {
            let nack: MsgpackNack = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::Nack(Nack {
                original_id: nack.original_id,
                error: nack.error,
            }))
        }
        typ::ERROR => {
            let em: MsgpackErrorMsg = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::Error(ErrorMsg {
                code: em.code,
                path: em.path,
                message: em.message,
            }))
        }
        typ::ACL_MANIFEST => {
            let manifest: crate::model::ACLManifest = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::AclManifest(manifest))
        }
        typ::SYSTEM => Ok(Decoded::System),
        _ => Ok(Decoded::Other {
            id: wire.id,
            typ: wire.typ,
        }),
    }
}

fn decode_json_msg(msg: Message) -> Result<Decoded> {
    match msg.typ {
        // MsgFileWrite + MsgFileNotify
        typ::FILE_WRITE | typ::FILE_NOTIFY => {
            let fw: JsonFileWrite = serde_json::from_value(msg.dat)?;
            Ok(Decoded::FileWrite(FileWrite {
                path: fw.path,
                etag: fw.etag,
                length: fw.length,
                content: fw.content,
            }))
        }
        typ::FILE_DELETE => {
            let fd: JsonFileDelete = serde_json::from_value(msg.dat)?;
            Ok(Decoded::FileDelete(FileDelete { path: fd.path }))
        }
        // MsgHttp
        typ::HTTP => {
            let hm: JsonHttpMsg = serde_json::from_value(msg.dat)?;
            Ok(Decoded::Http(HttpMsg {
                syft_url: hm.syft_url,
                id: hm.id,
                body: hm.body,
            }))
        }
        // MsgAck
        typ::ACK => {
            let ack: JsonAck = serde_json::from_value(msg.dat)?;
            Ok(Decoded::Ack(Ack {
                original_id: ack.original_id,
            }))
        }
        // MsgNack
        typ::NACK => {
            let nack: JsonNack = serde_json::from_value(msg.dat)?;
            Ok(Decoded::Nack(Nack {
                original_id: nack.original_id,
                error: nack.error,
            }))
        }
        typ::ERROR => {
            let em: JsonErrorMsg = serde_json::from_value(msg.dat)?;
            Ok(Decoded::Error(ErrorMsg {
                code: em.code,
                path: em.path,
                message: em.message,
            }))
        }
        typ::ACL_MANIFEST => {
            let manifest: crate::model::ACLManifest = serde_json::from_value(msg.dat)?;
            Ok(Decoded::AclManifest(manifest))
        }
        typ::SYSTEM => Ok(Decoded::System),
        _ => Ok(Decoded::Other {
            id: msg.id,
            typ: msg.typ,
        }),
    }
}

fn deserialize_base64_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<serde_json::Value>::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(serde_json::Value::String(s)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(serde::de::Error::custom)?;
            Ok(Some(bytes))
        }
        Some(serde_json::Value::Array(arr)) => {
            let mut out = Vec::with_capacity(arr.len());
            for v in arr {
                let n = v
                    .as_u64()
                    .ok_or_else(|| serde::de::Error::custom("expected byte"))?;
                out.push(n as u8);
            }
            Ok(Some(out))
        }
        _ => Err(serde::de::Error::custom(
            "expected base64 string or array for bytes",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ACLEntry, ACLManifest};

    #[test]
    fn file_write_round_trips_through_msgpack_envelope() {
        let encoded = encode_file_write("id-1", "alice@x/a.request", "etag1", 5, b"hello".to_vec()).unwrap();
        match decode_binary(&encoded).unwrap() {
            Decoded::FileWrite(fw) => {
                assert_eq!(fw.path, "alice@x/a.request");
                assert_eq!(fw.etag, "etag1");
                assert_eq!(fw.content, Some(b"hello".to_vec()));
            }
            other => panic!("expected FileWrite, got {other:?}"),
        }
    }

    #[test]
    fn acl_manifest_round_trips_through_msgpack_envelope() {
        let manifest = ACLManifest {
            version: 1,
            datasite: "alice@x".to_string(),
            principal_hash: "h".to_string(),
            generated: "2026-01-01T00:00:00Z".to_string(),
            acl_order: vec![ACLEntry {
                path: "alice@x".to_string(),
                hash: "a".to_string(),
            }],
        };
        let encoded = encode_msgpack("id-2", typ::ACL_MANIFEST, &manifest).unwrap();
        match decode_binary(&encoded).unwrap() {
            Decoded::AclManifest(decoded) => assert_eq!(decoded.datasite, "alice@x"),
            other => panic!("expected AclManifest, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_decodes_to_other() {
        let wire = WireMessage {
            id: "id-3".to_string(),
            typ: 999,
            dat: rmp_serde::to_vec_named(&serde_json::json!({})).unwrap(),
        };
        let payload = rmp_serde::to_vec_named(&wire).unwrap();
        let mut out = vec![MAGIC0, MAGIC1, VERSION, Encoding::MsgPack.as_byte()];
        out.extend_from_slice(&payload);
        match decode_binary(&out).unwrap() {
            Decoded::Other { typ, .. } => assert_eq!(typ, 999),
            other => panic!("expected Other, got {other:?}"),
        }
    }
}
