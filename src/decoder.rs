//! Tolerant decoder for wearable notification payloads.
//!
//! Peripherals in the field speak three independently evolved payload shapes.
//! They are tried in this order and the first one that decodes wins:
//!
//! 1. **Structured text**: a UTF-8 JSON object
//!    `{"did": .., "ts": .., "batt": .., "temp": .., "vitals": {"hr": .., "spo2": ..}}`
//!    where every field is optional.
//! 2. **Delimited inline text**: `O2:<float>,HR:<int>`.
//! 3. **Fixed-width binary**: 2 bytes (`[spo2, hr]` as unsigned bytes) or
//!    4 bytes (little-endian `u16` spo2 followed by little-endian `u16` hr).
//!
//! Missing fields take their defaults (device id per source, timestamp from the
//! ingestion clock, numeric vitals `0.0`). A payload that opens with `{` but is
//! not a valid object, such as truncated JSON or a string where a number
//! belongs, is a decode failure. It is not retried as another shape, so it can
//! never yield a zero-filled or garbage sample. A broken inline payload still
//! falls through to the binary shapes.
//!
//! Decoding has no side effects. The caller decides what to do with a
//! [`DecodeError`] (the ingest worker logs it and drops the packet).

use crate::error::DecodeError;
use crate::sample::{NewSample, RawPacket, SourceTag};
use serde::Deserialize;

const OXYGEN_MARKER: &str = "O2:";
const HEART_RATE_MARKER: &str = "HR:";

/// Which wire shape a payload was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// JSON object with optional keyed fields.
    Structured,
    /// `O2:..,HR:..` text.
    Inline,
    /// Two unsigned bytes.
    Binary8,
    /// Two little-endian `u16` values.
    Binary16,
}

#[derive(Debug, Deserialize)]
struct StructuredPacket {
    did: Option<String>,
    ts: Option<i64>,
    batt: Option<f64>,
    temp: Option<f64>,
    vitals: Option<StructuredVitals>,
}

#[derive(Debug, Deserialize)]
struct StructuredVitals {
    hr: Option<f64>,
    spo2: Option<f64>,
}

/// Fields a single payload shape managed to extract.
#[derive(Debug, Default)]
struct Decoded {
    device_id: Option<String>,
    timestamp_millis: Option<i64>,
    battery_pct: Option<f64>,
    temperature: Option<f64>,
    heart_rate: Option<f64>,
    spo2: Option<f64>,
    echo: String,
}

/// Stateless packet decoder.
///
/// The only configuration it carries is the pair of partition tags stamped on
/// every sample, which are constant per deployment.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    user_id: String,
    team_id: String,
}

impl PacketDecoder {
    /// Create a decoder that stamps samples with the given partition tags.
    pub fn new(user_id: impl Into<String>, team_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            team_id: team_id.into(),
        }
    }

    /// Decode a packet, defaulting the timestamp to its receive time.
    pub fn decode_packet(&self, packet: &RawPacket) -> Result<NewSample, DecodeError> {
        self.decode_at(packet.source, &packet.payload, packet.received_at_millis)
            .map(|(sample, _)| sample)
    }

    /// Decode a payload, defaulting the timestamp to the current time.
    pub fn decode(&self, source: SourceTag, payload: &[u8]) -> Result<NewSample, DecodeError> {
        self.decode_at(source, payload, crate::sample::now_millis())
            .map(|(sample, _)| sample)
    }

    /// Decode a payload using `now_millis` as the timestamp default.
    ///
    /// Also reports which shape matched.
    pub fn decode_at(
        &self,
        source: SourceTag,
        payload: &[u8],
        now_millis: i64,
    ) -> Result<(NewSample, PayloadShape), DecodeError> {
        let fail = |reason: String| DecodeError {
            reason,
            peripheral: source,
            payload_len: payload.len(),
        };

        if payload.is_empty() {
            return Err(fail("empty payload".to_string()));
        }

        let mut rejections = Vec::new();
        let text = std::str::from_utf8(payload).ok();

        if let Some(text) = text {
            if text.trim_start().starts_with('{') {
                match decode_structured(text) {
                    Ok(decoded) => {
                        return Ok((self.finish(source, decoded, now_millis), PayloadShape::Structured))
                    }
                    // a broken object is never reinterpreted as inline or binary
                    Err(reason) => return Err(fail(reason)),
                }
            }

            if text.contains(OXYGEN_MARKER) && text.contains(HEART_RATE_MARKER) {
                match decode_inline(text) {
                    Ok(decoded) => {
                        return Ok((self.finish(source, decoded, now_millis), PayloadShape::Inline))
                    }
                    Err(reason) => rejections.push(reason),
                }
            }
        }

        match decode_binary(payload) {
            Ok((decoded, shape)) => Ok((self.finish(source, decoded, now_millis), shape)),
            Err(reason) => {
                rejections.push(reason);
                Err(fail(rejections.join("; ")))
            }
        }
    }

    fn finish(&self, source: SourceTag, decoded: Decoded, now_millis: i64) -> NewSample {
        NewSample {
            user_id: self.user_id.clone(),
            team_id: self.team_id.clone(),
            device_id: decoded
                .device_id
                .unwrap_or_else(|| source.default_device_id().to_string()),
            source,
            timestamp_millis: decoded.timestamp_millis.unwrap_or(now_millis),
            battery_pct: decoded.battery_pct.unwrap_or(0.0),
            heart_rate: decoded.heart_rate.unwrap_or(0.0),
            spo2: decoded.spo2.unwrap_or(0.0),
            temperature: decoded.temperature.unwrap_or(0.0),
            raw_payload_echo: decoded.echo,
        }
    }
}

fn decode_structured(text: &str) -> Result<Decoded, String> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("malformed structured payload: {e}"))?;
    if !value.is_object() {
        return Err("structured payload is not a keyed object".to_string());
    }

    let packet = StructuredPacket::deserialize(&value)
        .map_err(|e| format!("malformed structured payload: {e}"))?;
    let (heart_rate, spo2) = match packet.vitals {
        Some(vitals) => (vitals.hr, vitals.spo2),
        None => (None, None),
    };

    Ok(Decoded {
        device_id: packet.did,
        timestamp_millis: packet.ts,
        battery_pct: packet.batt,
        temperature: packet.temp,
        heart_rate,
        spo2,
        // serde_json maps are key-ordered, so this is canonical
        echo: value.to_string(),
    })
}

fn decode_inline(text: &str) -> Result<Decoded, String> {
    let oxygen_field = field_after(text, OXYGEN_MARKER);
    let heart_rate_field = field_after(text, HEART_RATE_MARKER);

    let oxygen: f64 = oxygen_field
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| format!("inline oxygen value '{oxygen_field}' is not a number"))?;
    let heart_rate: i32 = heart_rate_field
        .parse()
        .map_err(|_| format!("inline heart rate '{heart_rate_field}' is not an integer"))?;

    Ok(Decoded {
        spo2: Some(oxygen),
        heart_rate: Some(f64::from(heart_rate)),
        echo: text.trim().to_string(),
        ..Decoded::default()
    })
}

/// Text between `marker` and the next comma (or end of input), trimmed.
fn field_after<'a>(text: &'a str, marker: &str) -> &'a str {
    let rest = text
        .find(marker)
        .map_or("", |start| &text[start + marker.len()..]);
    rest.split(',').next().unwrap_or("").trim()
}

fn decode_binary(payload: &[u8]) -> Result<(Decoded, PayloadShape), String> {
    let (oxygen, heart_rate, shape) = match *payload {
        [oxygen, heart_rate] => (u16::from(oxygen), u16::from(heart_rate), PayloadShape::Binary8),
        [o0, o1, h0, h1] => (
            u16::from_le_bytes([o0, o1]),
            u16::from_le_bytes([h0, h1]),
            PayloadShape::Binary16,
        ),
        _ => {
            return Err(format!(
                "unsupported binary length {} (expected 2 or 4 bytes)",
                payload.len()
            ))
        }
    };

    Ok((
        Decoded {
            spo2: Some(f64::from(oxygen)),
            heart_rate: Some(f64::from(heart_rate)),
            echo: to_hex(payload),
            ..Decoded::default()
        },
        shape,
    ))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn decoder() -> PacketDecoder {
        PacketDecoder::new("user_01", "default")
    }

    fn decode(source: SourceTag, payload: &[u8]) -> Result<(NewSample, PayloadShape), DecodeError> {
        decoder().decode_at(source, payload, NOW)
    }

    #[test]
    fn test_structured_full_payload() {
        let payload = br#"{"did":"W07","ts":1699999999000,"batt":81.5,"temp":36.4,"vitals":{"hr":71,"spo2":97.5}}"#;
        let (sample, shape) = decode(SourceTag::Wrist, payload).unwrap();

        assert_eq!(shape, PayloadShape::Structured);
        assert_eq!(sample.device_id, "W07");
        assert_eq!(sample.timestamp_millis, 1_699_999_999_000);
        assert_eq!(sample.battery_pct, 81.5);
        assert_eq!(sample.temperature, 36.4);
        assert_eq!(sample.heart_rate, 71.0);
        assert_eq!(sample.spo2, 97.5);
        assert_eq!(sample.user_id, "user_01");
        assert_eq!(sample.team_id, "default");
    }

    #[test]
    fn test_structured_each_missing_field_defaults_alone() {
        let full = serde_json::json!({
            "did": "C09", "ts": 42, "batt": 50.0, "temp": 37.0,
            "vitals": {"hr": 80.0, "spo2": 96.0}
        });

        for field in ["did", "ts", "batt", "temp"] {
            let mut value = full.clone();
            value.as_object_mut().unwrap().remove(field);
            let (s, _) = decode(SourceTag::Chest, value.to_string().as_bytes()).unwrap();

            assert_eq!(s.device_id, if field == "did" { "C01" } else { "C09" });
            assert_eq!(s.timestamp_millis, if field == "ts" { NOW } else { 42 });
            assert_eq!(s.battery_pct, if field == "batt" { 0.0 } else { 50.0 });
            assert_eq!(s.temperature, if field == "temp" { 0.0 } else { 37.0 });
            assert_eq!(s.heart_rate, 80.0);
            assert_eq!(s.spo2, 96.0);
        }

        for field in ["hr", "spo2"] {
            let mut value = full.clone();
            value["vitals"].as_object_mut().unwrap().remove(field);
            let (s, _) = decode(SourceTag::Chest, value.to_string().as_bytes()).unwrap();

            assert_eq!(s.heart_rate, if field == "hr" { 0.0 } else { 80.0 });
            assert_eq!(s.spo2, if field == "spo2" { 0.0 } else { 96.0 });
            assert_eq!(s.device_id, "C09");
        }
    }

    #[test]
    fn test_structured_empty_object_takes_all_defaults() {
        let (s, _) = decode(SourceTag::Wrist, b"{}").unwrap();
        assert_eq!(s.device_id, "W01");
        assert_eq!(s.timestamp_millis, NOW);
        assert_eq!(s.battery_pct, 0.0);
        assert_eq!(s.heart_rate, 0.0);
        assert_eq!(s.spo2, 0.0);
        assert_eq!(s.temperature, 0.0);
    }

    #[test]
    fn test_structured_echo_is_canonical() {
        let (s, _) = decode(SourceTag::Wrist, br#" { "ts": 5, "did": "W02" } "#).unwrap();
        assert_eq!(s.raw_payload_echo, r#"{"did":"W02","ts":5}"#);
    }

    #[test]
    fn test_structured_clock_skew_is_accepted() {
        let (s, _) = decode(SourceTag::Wrist, br#"{"ts": 1}"#).unwrap();
        assert_eq!(s.timestamp_millis, 1);
    }

    #[test]
    fn test_malformed_structured_is_failure() {
        let err = decode(SourceTag::Wrist, br#"{"did":"W01","vitals":{"hr":7"#).unwrap_err();
        assert!(err.reason.contains("malformed structured payload"));
        assert_eq!(err.peripheral, SourceTag::Wrist);
    }

    #[test]
    fn test_structured_wrong_type_is_failure_not_zero() {
        let err = decode(SourceTag::Chest, br#"{"batt":"full"}"#).unwrap_err();
        assert!(err.reason.contains("malformed structured payload"));
    }

    #[test]
    fn test_truncated_structured_never_decodes_as_binary() {
        // 4 bytes, but it opened as an object
        let err = decode(SourceTag::Wrist, br#"{"ts"#).unwrap_err();
        assert!(err.reason.contains("malformed structured payload"));
        assert!(!err.reason.contains("binary"));
        assert_eq!(err.payload_len, 4);

        let err = decode(SourceTag::Chest, b"{1").unwrap_err();
        assert_eq!(err.payload_len, 2);
    }

    #[test]
    fn test_structured_array_is_failure() {
        let err = decode(SourceTag::Wrist, b" [1, 2]").unwrap_err();
        assert!(err.reason.contains("unsupported binary length"));

        let err = decode(SourceTag::Wrist, br#"{"a":[1,2]} trailing"#).unwrap_err();
        assert!(err.reason.contains("malformed structured payload"));
    }

    #[test]
    fn test_inline_text() {
        let (s, shape) = decode(SourceTag::Wrist, b"O2:97.5,HR:88").unwrap();
        assert_eq!(shape, PayloadShape::Inline);
        assert_eq!(s.spo2, 97.5);
        assert_eq!(s.heart_rate, 88.0);
        assert_eq!(s.device_id, "W01");
        assert_eq!(s.timestamp_millis, NOW);
        assert_eq!(s.battery_pct, 0.0);
        assert_eq!(s.temperature, 0.0);
        assert_eq!(s.raw_payload_echo, "O2:97.5,HR:88");
    }

    #[test]
    fn test_inline_tolerates_whitespace_and_order() {
        let (s, _) = decode(SourceTag::Chest, b" HR: 61 , O2: 95 \n").unwrap();
        assert_eq!(s.heart_rate, 61.0);
        assert_eq!(s.spo2, 95.0);
        assert_eq!(s.device_id, "C01");
    }

    #[test]
    fn test_inline_signed_heart_rate() {
        let (s, _) = decode(SourceTag::Wrist, b"O2:96,HR:-1").unwrap();
        assert_eq!(s.heart_rate, -1.0);
        assert_eq!(s.spo2, 96.0);

        assert!(decode(SourceTag::Wrist, b"O2:96,HR:7.5").is_err());
    }

    #[test]
    fn test_inline_bad_number_is_failure() {
        let err = decode(SourceTag::Wrist, b"O2:abc,HR:88").unwrap_err();
        assert!(err.reason.contains("inline oxygen value"));
        assert!(err.reason.contains("unsupported binary length"));
    }

    #[test]
    fn test_binary_two_bytes() {
        let (s, shape) = decode(SourceTag::Wrist, &[0x5F, 0x48]).unwrap();
        assert_eq!(shape, PayloadShape::Binary8);
        assert_eq!(s.spo2, 95.0);
        assert_eq!(s.heart_rate, 72.0);
        assert_eq!(s.raw_payload_echo, "5f48");
    }

    #[test]
    fn test_binary_two_bytes_unsigned() {
        let (s, _) = decode(SourceTag::Chest, &[0xFF, 0xC8]).unwrap();
        assert_eq!(s.spo2, 255.0);
        assert_eq!(s.heart_rate, 200.0);
    }

    #[test]
    fn test_binary_four_bytes_little_endian() {
        let (s, shape) = decode(SourceTag::Chest, &[0x01, 0x00, 0x50, 0x00]).unwrap();
        assert_eq!(shape, PayloadShape::Binary16);
        assert_eq!(s.spo2, 1.0);
        assert_eq!(s.heart_rate, 80.0);
        assert_eq!(s.device_id, "C01");
    }

    #[test]
    fn test_unsupported_lengths_fail() {
        for len in [1usize, 3, 5, 8, 20] {
            let payload = vec![0x80; len];
            let err = decode(SourceTag::Wrist, &payload).unwrap_err();
            assert_eq!(err.payload_len, len);
        }
    }

    #[test]
    fn test_empty_payload_fails() {
        let err = decode(SourceTag::Chest, &[]).unwrap_err();
        assert_eq!(err.reason, "empty payload");
        assert_eq!(err.payload_len, 0);
    }

    #[test]
    fn test_decode_stamps_current_time_when_missing() {
        let before = crate::sample::now_millis();
        let sample = decoder().decode(SourceTag::Chest, &[0x60, 0x4B]).unwrap();
        let after = crate::sample::now_millis();

        assert_eq!(sample.spo2, 96.0);
        assert_eq!(sample.heart_rate, 75.0);
        assert_eq!(sample.device_id, "C01");
        assert!((before..=after).contains(&sample.timestamp_millis));

        let err = decoder().decode(SourceTag::Chest, &[1, 2, 3]).unwrap_err();
        assert_eq!(err.peripheral, SourceTag::Chest);
    }

    #[test]
    fn test_decode_packet_uses_receive_time() {
        let packet = RawPacket {
            source: SourceTag::Wrist,
            payload: b"{}".to_vec(),
            received_at_millis: 123,
        };
        let sample = decoder().decode_packet(&packet).unwrap();
        assert_eq!(sample.timestamp_millis, 123);
    }
}
