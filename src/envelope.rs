use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The three phases of an exchange: a request, the receipt acknowledgement
/// that stops the sender's retries, and the response carrying a return value.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum MessageType {
    Request,
    Ack,
    Response,
}

impl MessageType {
    fn index(&self) -> u8 {
        match self {
            MessageType::Request => 0,
            MessageType::Ack => 1,
            MessageType::Response => 2,
        }
    }

    fn from_index(index: u8) -> Option<MessageType> {
        match index {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Ack),
            2 => Some(MessageType::Response),
            _ => None,
        }
    }
}

/// Wire tag of a compression codec. The tag is part of the flag byte, so the
/// numbering is fixed forever regardless of which codecs a build actually
/// ships.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum CodecId {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl CodecId {
    pub fn index(&self) -> u8 {
        match self {
            CodecId::None => 0,
            CodecId::Gzip => 1,
            CodecId::Snappy => 2,
            CodecId::Lz4 => 3,
            CodecId::Zstd => 4,
        }
    }

    pub fn from_index(index: u8) -> Option<CodecId> {
        match index {
            0 => Some(CodecId::None),
            1 => Some(CodecId::Gzip),
            2 => Some(CodecId::Snappy),
            3 => Some(CodecId::Lz4),
            4 => Some(CodecId::Zstd),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Gzip => "gzip",
            CodecId::Snappy => "snappy",
            CodecId::Lz4 => "lz4",
            CodecId::Zstd => "zstd",
        }
    }
}

/// Decoded form of the packed flag byte.
///
/// ```ascii
/// bit 0-2: codec tag (0=NONE 1=GZIP 2=SNAPPY 3=LZ4 4=ZSTD)
/// bit 3:   compressed
/// bit 4:   chunked
/// bit 5-6: message type (0=REQ 1=ACK 2=RES)
/// bit 7:   reserved - written as zero, ignored on decode
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Flags {
    pub message_type: MessageType,
    pub codec: CodecId,
    pub compressed: bool,
    pub chunked: bool,
}

impl Flags {
    pub fn encode(&self) -> u8 {
        self.codec.index()
            | (self.compressed as u8) << 3
            | (self.chunked as u8) << 4
            | self.message_type.index() << 5
    }

    /// Returns None for byte values naming an unknown codec or message type -
    /// the engine forwards such datagrams to the passthrough channel rather
    /// than guessing.
    pub fn decode(byte: u8) -> Option<Flags> {
        Some(Flags {
            codec: CodecId::from_index(byte & 0b111)?,
            compressed: byte & (1 << 3) != 0,
            chunked: byte & (1 << 4) != 0,
            message_type: MessageType::from_index((byte >> 5) & 0b11)?,
        })
    }
}

/// The unit exchanged on the wire: a self-describing JSON object. The JSON
/// shape is canonical so any compliant implementation interoperates with any
/// other; all protocol metadata besides the id is packed into `flags`.
///
/// `ci`/`ct` (chunk index/total) are present iff the chunked bit is set;
/// `os`/`cs` (original/compressed size) are present iff the compressed bit is
/// set, and on the first chunk only when chunked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub flags: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cs: Option<u64>,
}

impl Envelope {
    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a received datagram as an envelope. Returns None when the
    /// payload is not one (not JSON, or JSON without `id` and `flags`) so the
    /// engine can pass non-protocol datagrams through untouched.
    pub fn parse(buf: &[u8]) -> Option<Envelope> {
        serde_json::from_slice(buf).ok()
    }
}

/// SHA-256 over the serialized body, as lowercase hex.
///
/// String bodies hash their raw UTF-8 - this is what makes per-chunk
/// checksums cover exactly the chunk's base64 text. Everything else hashes
/// its canonical JSON serialization.
pub fn body_checksum(body: &Value) -> String {
    let mut sha256 = Sha256::default();
    match body {
        Value::String(s) => sha256.update(s.as_bytes()),
        other => sha256.update(
            serde_json::to_vec(other).expect("JSON value must serialize"),
        ),
    }
    hex::encode(sha256.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_flags_round_trip_all_combinations() {
        let types = [MessageType::Request, MessageType::Ack, MessageType::Response];
        let codecs = [CodecId::None, CodecId::Gzip, CodecId::Snappy, CodecId::Lz4, CodecId::Zstd];

        for message_type in types {
            for codec in codecs {
                for compressed in [false, true] {
                    for chunked in [false, true] {
                        let flags = Flags { message_type, codec, compressed, chunked };
                        assert_eq!(Flags::decode(flags.encode()), Some(flags));
                    }
                }
            }
        }
    }

    #[rstest]
    #[case::unknown_codec_5(0b0000_0101)]
    #[case::unknown_codec_7(0b0000_0111)]
    #[case::unknown_type_3(0b0110_0000)]
    fn test_flags_decode_rejects_unknown(#[case] byte: u8) {
        assert_eq!(Flags::decode(byte), None);
    }

    #[test]
    fn test_flags_decode_ignores_reserved_bit() {
        for byte in 0u8..=0x7f {
            assert_eq!(Flags::decode(byte | 0x80), Flags::decode(byte));
        }
    }

    #[test]
    fn test_flags_bit_positions() {
        let flags = Flags {
            message_type: MessageType::Response,
            codec: CodecId::Zstd,
            compressed: true,
            chunked: true,
        };
        assert_eq!(flags.encode(), 0b0101_1100);
    }

    #[rstest]
    #[case::ack(Envelope {
        id: "17".to_string(), body: None, checksum: None, flags: 0b0010_0000,
        ci: None, ct: None, os: None, cs: None,
    })]
    #[case::request(Envelope {
        id: "8123456789".to_string(), body: Some(json!({"message": "hi"})),
        checksum: Some("ab12".to_string()), flags: 0,
        ci: None, ct: None, os: None, cs: None,
    })]
    #[case::compressed_chunk(Envelope {
        id: "8123456789-chunk-0".to_string(), body: Some(json!("aGVsbG8=")),
        checksum: None, flags: 0b0001_1001,
        ci: Some(0), ct: Some(3), os: Some(2000), cs: Some(700),
    })]
    fn test_envelope_serialize_parse_round_trip(#[case] envelope: Envelope) {
        let buf = envelope.serialize().unwrap();
        assert_eq!(Envelope::parse(&buf), Some(envelope));
    }

    #[test]
    fn test_ack_envelope_omits_optional_fields() {
        let ack = Envelope {
            id: "17".to_string(), body: None, checksum: None, flags: 32,
            ci: None, ct: None, os: None, cs: None,
        };
        let text = String::from_utf8(ack.serialize().unwrap()).unwrap();
        assert_eq!(text, r#"{"id":"17","flags":32}"#);
    }

    #[rstest]
    #[case::not_json(b"hello there" as &[u8])]
    #[case::json_without_id(br#"{"flags": 0}"#)]
    #[case::json_without_flags(br#"{"id": "17"}"#)]
    #[case::json_array(br#"[1, 2, 3]"#)]
    #[case::empty(b"")]
    fn test_parse_rejects_non_envelopes(#[case] buf: &[u8]) {
        assert_eq!(Envelope::parse(buf), None);
    }

    #[test]
    fn test_parse_tolerates_unknown_fields() {
        let parsed = Envelope::parse(br#"{"id":"1","flags":0,"future_field":true}"#).unwrap();
        assert_eq!(parsed.id, "1");
    }

    #[test]
    fn test_string_body_checksum_covers_raw_text() {
        // sha256("hello"), not sha256("\"hello\"")
        assert_eq!(
            body_checksum(&json!("hello")),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_object_body_checksum_covers_json_serialization() {
        let mut sha256 = Sha256::default();
        sha256.update(br#"{"a":1}"#);
        assert_eq!(body_checksum(&json!({"a": 1})), hex::encode(sha256.finalize()));
    }
}
