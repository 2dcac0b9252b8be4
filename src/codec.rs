//! Kasa UDP wire codec: autokey XOR obfuscation plus the handful of JSON
//! shapes the device manager needs to compose and recognize.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

const OBFUSCATION_KEY: u8 = 0xAB;
const MAX_PAYLOAD: usize = 1500;

/// Obfuscates a plaintext JSON payload. `EncodingTooLarge` if it would not fit
/// in a single Kasa datagram (no length prefix - the datagram boundary is the
/// framing, so anything we can't fit in one packet can't be sent at all).
fn obfuscate(data: &[u8]) -> Result<Bytes, CodecError> {
    if data.len() > MAX_PAYLOAD {
        return Err(CodecError::EncodingTooLarge { len: data.len() });
    }

    let mut key = OBFUSCATION_KEY;
    let mut out = BytesMut::with_capacity(data.len());
    for &b in data {
        key ^= b;
        out.put_u8(key);
    }
    Ok(out.freeze())
}

/// Reverses [`obfuscate`]. The key advances on the *received* byte, not the
/// decoded one - this asymmetry is what makes the cipher an autokey stream.
pub fn deobfuscate(data: &[u8]) -> Bytes {
    let mut key = OBFUSCATION_KEY;
    let mut out = BytesMut::with_capacity(data.len());
    for &c in data {
        out.put_u8(key ^ c);
        key = c;
    }
    out.freeze()
}

#[derive(Debug, Serialize)]
struct SenseRequest {
    system: SenseSystem,
}

#[derive(Debug, Serialize)]
struct SenseSystem {
    get_sysinfo: serde_json::Value,
}

/// Composes and obfuscates the `get_sysinfo` probe.
pub fn encode_sense() -> Result<Bytes, CodecError> {
    let request = SenseRequest {
        system: SenseSystem {
            get_sysinfo: serde_json::json!({}),
        },
    };
    let data = serde_json::to_vec(&request).expect("SenseRequest always serializes");
    obfuscate(&data)
}

#[derive(Debug, Serialize)]
struct SetRelayRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<SetRelayContext>,
    system: SetRelaySystem,
}

#[derive(Debug, Serialize)]
struct SetRelayContext {
    child_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SetRelaySystem {
    set_relay_state: SetRelayState,
}

#[derive(Debug, Serialize)]
struct SetRelayState {
    state: i64,
}

/// Composes and obfuscates a `set_relay_state` command. `child_id` scopes the
/// command to one outlet of a multi-plug device; the protocol concatenates
/// `device_id` and `child_id` directly, with no separator.
pub fn encode_set_relay(
    device_id: &str,
    child_id: Option<&str>,
    on: bool,
) -> Result<Bytes, CodecError> {
    let context = child_id.map(|child| SetRelayContext {
        child_ids: vec![format!("{device_id}{child}")],
    });
    let request = SetRelayRequest {
        context,
        system: SetRelaySystem {
            set_relay_state: SetRelayState {
                state: if on { 1 } else { 0 },
            },
        },
    };
    let data = serde_json::to_vec(&request).expect("SetRelayRequest always serializes");
    obfuscate(&data)
}

#[derive(Debug, Deserialize)]
struct ReplyEnvelope {
    system: ReplySystem,
}

#[derive(Debug, Deserialize)]
struct ReplySystem {
    get_sysinfo: Option<SysinfoBody>,
    set_relay_state: Option<SetRelayReplyBody>,
}

#[derive(Debug, Deserialize)]
struct SysinfoBody {
    #[serde(rename = "deviceId")]
    device_id: String,
    model: Option<String>,
    alias: Option<String>,
    relay_state: Option<i64>,
    children: Option<Vec<ChildBody>>,
}

#[derive(Debug, Deserialize)]
struct ChildBody {
    id: String,
    alias: Option<String>,
    state: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SetRelayReplyBody {
    err_code: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSysinfo {
    pub id: String,
    pub alias: Option<String>,
    pub state: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysinfo {
    pub device_id: String,
    pub model: Option<String>,
    pub alias: Option<String>,
    /// `None` when children are present - the per-outlet state lives in `children` instead.
    pub relay_state: Option<bool>,
    pub children: Vec<ChildSysinfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Sysinfo(Sysinfo),
    SetRelayAck { ok: bool },
}

/// Deobfuscates and parses an inbound datagram. Malformed or unrecognized
/// payloads surface as `CodecError` so callers can log-and-drop per policy.
pub fn decode_reply(data: &[u8]) -> Result<Reply, CodecError> {
    let plaintext = deobfuscate(data);
    let text = std::str::from_utf8(&plaintext)?;
    let envelope: ReplyEnvelope = serde_json::from_str(text)?;

    if let Some(sysinfo) = envelope.system.get_sysinfo {
        return Ok(Reply::Sysinfo(Sysinfo {
            device_id: sysinfo.device_id,
            model: sysinfo.model,
            alias: sysinfo.alias,
            relay_state: sysinfo.relay_state.map(|s| s != 0),
            children: sysinfo
                .children
                .unwrap_or_default()
                .into_iter()
                .map(|c| ChildSysinfo {
                    id: c.id,
                    alias: c.alias,
                    state: c.state.unwrap_or(0) != 0,
                })
                .collect(),
        }));
    }

    if let Some(set_relay) = envelope.system.set_relay_state {
        return Ok(Reply::SetRelayAck {
            ok: set_relay.err_code == 0,
        });
    }

    Err(CodecError::UnrecognizedShape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscation_round_trips() {
        let samples: &[&[u8]] = &[
            b"",
            b"{\"system\":{\"get_sysinfo\":{}}}",
            &[0x00, 0xff, 0xab, 0x01, 0x7f],
            &[0u8; 256],
            &(0..=255u8).collect::<Vec<_>>(),
        ];

        for sample in samples {
            let encoded = obfuscate(sample).expect("within MTU");
            let decoded = deobfuscate(&encoded);
            assert_eq!(&decoded[..], *sample);
        }
    }

    #[test]
    fn mtu_boundary() {
        let ok = vec![0u8; 1500];
        assert!(obfuscate(&ok).is_ok());

        let too_big = vec![0u8; 1501];
        match obfuscate(&too_big) {
            Err(CodecError::EncodingTooLarge { len }) => assert_eq!(len, 1501),
            other => panic!("expected EncodingTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn encode_sense_message() {
        let encoded = encode_sense().unwrap();
        let plaintext = deobfuscate(&encoded);
        assert_eq!(&plaintext[..], br#"{"system":{"get_sysinfo":{}}}"#);
    }

    #[test]
    fn encode_set_relay_single_outlet() {
        let encoded = encode_set_relay("AAA", None, true).unwrap();
        let plaintext = deobfuscate(&encoded);
        assert_eq!(
            &plaintext[..],
            br#"{"system":{"set_relay_state":{"state":1}}}"#
        );
    }

    #[test]
    fn encode_set_relay_child_outlet_concatenates_without_separator() {
        let encoded = encode_set_relay("BBB", Some("01"), false).unwrap();
        let plaintext = deobfuscate(&encoded);
        assert_eq!(
            &plaintext[..],
            br#"{"context":{"child_ids":["BBB01"]},"system":{"set_relay_state":{"state":0}}}"#
        );
    }

    fn encode_and_obfuscate(json: &str) -> Bytes {
        obfuscate(json.as_bytes()).unwrap()
    }

    #[test]
    fn decode_single_outlet_sysinfo() {
        let raw = encode_and_obfuscate(
            r#"{"system":{"get_sysinfo":{"deviceId":"AAA","model":"HS100","alias":"Lamp","relay_state":0}}}"#,
        );
        let reply = decode_reply(&raw).unwrap();
        match reply {
            Reply::Sysinfo(info) => {
                assert_eq!(info.device_id, "AAA");
                assert_eq!(info.model.as_deref(), Some("HS100"));
                assert_eq!(info.alias.as_deref(), Some("Lamp"));
                assert_eq!(info.relay_state, Some(false));
                assert!(info.children.is_empty());
            }
            other => panic!("expected Sysinfo, got {other:?}"),
        }
    }

    #[test]
    fn decode_multi_outlet_sysinfo() {
        let raw = encode_and_obfuscate(
            r#"{"system":{"get_sysinfo":{"deviceId":"BBB","children":[{"id":"00","alias":"Left","state":0},{"id":"01","alias":"Right","state":1}]}}}"#,
        );
        let reply = decode_reply(&raw).unwrap();
        match reply {
            Reply::Sysinfo(info) => {
                assert_eq!(info.device_id, "BBB");
                assert_eq!(info.children.len(), 2);
                assert_eq!(info.children[0].id, "00");
                assert!(!info.children[0].state);
                assert_eq!(info.children[1].id, "01");
                assert!(info.children[1].state);
            }
            other => panic!("expected Sysinfo, got {other:?}"),
        }
    }

    #[test]
    fn decode_set_relay_ack() {
        let raw = encode_and_obfuscate(r#"{"system":{"set_relay_state":{"err_code":0}}}"#);
        assert_eq!(decode_reply(&raw).unwrap(), Reply::SetRelayAck { ok: true });

        let raw = encode_and_obfuscate(r#"{"system":{"set_relay_state":{"err_code":1}}}"#);
        assert_eq!(
            decode_reply(&raw).unwrap(),
            Reply::SetRelayAck { ok: false }
        );
    }

    #[test]
    fn decode_malformed_json_is_dropped() {
        let raw = encode_and_obfuscate("not json");
        assert!(matches!(
            decode_reply(&raw),
            Err(CodecError::MalformedReply(_))
        ));
    }

    #[test]
    fn decode_unrecognized_shape() {
        let raw = encode_and_obfuscate(r#"{"system":{"reboot":{}}}"#);
        assert!(matches!(
            decode_reply(&raw),
            Err(CodecError::UnrecognizedShape)
        ));
    }
}
