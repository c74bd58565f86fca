//! Telemetry record types shared by the decoder, the store and the sync path.
//!
//! A [`RawPacket`] is what the external BLE layer hands over: a payload tagged
//! with the peripheral it came from. Decoding turns it into a [`NewSample`],
//! which becomes a [`Sample`] once the store has assigned it an id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which wearable a packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// Wrist-worn peripheral.
    Wrist,
    /// Chest-strap peripheral.
    Chest,
}

impl SourceTag {
    /// Device id used when the payload does not carry one.
    pub fn default_device_id(self) -> &'static str {
        match self {
            SourceTag::Wrist => "W01",
            SourceTag::Chest => "C01",
        }
    }

    /// Wire name (`"wrist"` / `"chest"`).
    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::Wrist => "wrist",
            SourceTag::Chest => "chest",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wrist" => Ok(SourceTag::Wrist),
            "chest" => Ok(SourceTag::Chest),
            other => Err(format!("unknown source '{other}', expected wrist or chest")),
        }
    }
}

/// One notification payload as delivered by the BLE layer. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Peripheral the payload came from.
    pub source: SourceTag,
    /// Notification bytes, untouched.
    pub payload: Vec<u8>,
    /// Wall-clock time the host received the notification.
    pub received_at_millis: i64,
}

impl RawPacket {
    /// Stamp a payload with the current wall-clock time.
    pub fn now(source: SourceTag, payload: Vec<u8>) -> Self {
        Self {
            source,
            payload,
            received_at_millis: now_millis(),
        }
    }
}

/// Decoded telemetry that has not been given an id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSample {
    /// Partition tag for the wearer.
    pub user_id: String,
    /// Partition tag for the team.
    pub team_id: String,
    /// Device id from the payload or the per-source default.
    pub device_id: String,
    /// Peripheral the sample came from.
    pub source: SourceTag,
    /// Sample time in epoch millis. Taken as decoded, not checked for skew.
    pub timestamp_millis: i64,
    /// Battery level in percent.
    pub battery_pct: f64,
    /// Heart rate in beats per minute.
    pub heart_rate: f64,
    /// Oxygen saturation in percent.
    pub spo2: f64,
    /// Skin temperature.
    pub temperature: f64,
    /// Canonical text form of the decoded payload, kept for audit.
    pub raw_payload_echo: String,
}

/// A decoded sample owned by the store.
///
/// Immutable once appended: the only thing that ever happens to it afterwards
/// is deletion by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Store-assigned, strictly increasing id.
    pub id: u64,
    /// Everything the decoder produced.
    #[serde(flatten)]
    pub data: NewSample,
}

impl Sample {
    /// Attach an id to decoded data.
    pub fn new(id: u64, data: NewSample) -> Self {
        Self { id, data }
    }
}

impl std::ops::Deref for Sample {
    type Target = NewSample;

    fn deref(&self) -> &NewSample {
        &self.data
    }
}

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_defaults() {
        assert_eq!(SourceTag::Wrist.default_device_id(), "W01");
        assert_eq!(SourceTag::Chest.default_device_id(), "C01");
    }

    #[test]
    fn test_source_parse() {
        assert_eq!("wrist".parse::<SourceTag>(), Ok(SourceTag::Wrist));
        assert_eq!(" CHEST ".parse::<SourceTag>(), Ok(SourceTag::Chest));
        assert!("ankle".parse::<SourceTag>().is_err());
    }

    #[test]
    fn test_sample_serializes_flat() {
        let sample = Sample::new(
            7,
            NewSample {
                user_id: "user_01".into(),
                team_id: "default".into(),
                device_id: "W01".into(),
                source: SourceTag::Wrist,
                timestamp_millis: 1_700_000_000_000,
                battery_pct: 80.0,
                heart_rate: 72.0,
                spo2: 98.0,
                temperature: 36.6,
                raw_payload_echo: "{}".into(),
            },
        );

        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["source"], "wrist");
        assert_eq!(value["device_id"], "W01");
    }
}
