//! Duration fields in config files
//!
//! Config files spell durations as plain integers. Long intervals use
//! seconds (`keepalive_interval = 30`); per-candidate timeouts and backoff
//! steps use milliseconds (`lan = 3000`).

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

fn write_u64<S: Serializer>(value: u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value)
}

fn read_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    u64::deserialize(deserializer)
}

/// `#[serde(with = "duration_secs")]`: whole seconds
pub mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        write_u64(value.as_secs(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        read_u64(deserializer).map(Duration::from_secs)
    }
}

/// `#[serde(with = "duration_millis")]`: milliseconds
pub mod duration_millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        write_u64(value.as_millis() as u64, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        read_u64(deserializer).map(Duration::from_millis)
    }
}
