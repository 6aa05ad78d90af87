use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

/// Orders the channel configuration in the yaml file.
/// If this mapping is not used there is no guarantee
/// that the config files will not be over written
/// needlessly (i.e. same information in different order).
///
/// * `value`: `HashMap`
/// * `serializer`: Serializer
pub fn ordered_u8_map<S, T>(value: &HashMap<u8, T>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize,
{
    let ordered: BTreeMap<_, _> = value.iter().collect();
    ordered.serialize(serializer)
}

/// Reads a channel map keyed by channel index. Keys may be integers or
/// integer strings, the config crate hands map keys over as strings.
pub fn u8_keyed_map<'de, D, T>(deserializer: D) -> Result<HashMap<u8, T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let entries = HashMap::<ChannelKey, T>::deserialize(deserializer)?;
    Ok(entries.into_iter().map(|(key, value)| (key.0, value)).collect())
}

#[derive(PartialEq, Eq, Hash)]
struct ChannelKey(u8);

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ChannelKeyVisitor {}).map(ChannelKey)
    }
}

struct ChannelKeyVisitor {}

impl<'de> Visitor<'de> for ChannelKeyVisitor {
    type Value = u8;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a channel index from 0 to 255")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u8::try_from(v).map_err(|_| E::custom(format!("channel {v} out of range")))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u8::try_from(v).map_err(|_| E::custom(format!("channel {v} out of range")))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.trim()
            .parse::<u8>()
            .map_err(|_| E::custom(format!("{v:?} is not a channel index")))
    }
}

/// I2C addresses are written in hex on data sheets and silk screens,
/// so they are stored as `"0x20"` strings in the config files.
pub mod hex_u8 {
    use super::*;

    pub fn serialize<S>(value: &u8, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{value:#04x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(HexAddressVisitor {})
    }
}

/// Accepts either a plain integer or a `0x` prefixed hex string.
struct HexAddressVisitor {}

impl<'de> Visitor<'de> for HexAddressVisitor {
    type Value = u8;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("an I2C address as an integer or a hex string such as \"0x20\"")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u8::try_from(v).map_err(|_| E::custom(format!("I2C address {v} out of range")))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u8::try_from(v).map_err(|_| E::custom(format!("I2C address {v} out of range")))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        let trimmed = v.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => trimmed.parse::<u8>(),
        };
        parsed.map_err(|_| E::custom(format!("Unknown I2C address format {v:?}")))
    }
}
