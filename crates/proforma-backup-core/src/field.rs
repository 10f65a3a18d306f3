use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::StableId;

/// One optional record attribute.
///
/// On the wire a key missing from the JSON object is [`Field::Absent`] and
/// leaves the stored value alone, an explicit `null` is [`Field::Null`] and
/// clears it, and anything else is [`Field::Set`]. Stored records only hold
/// `Absent` or `Set`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Field<T> {
    #[default]
    Absent,
    Null,
    Set(T),
}

impl<T> Field<T> {
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Set(value) => Some(value),
            Self::Absent | Self::Null => None,
        }
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Lift a stored column, where no value means the attribute was never set or was cleared.
    #[must_use]
    pub fn from_stored(value: Option<T>) -> Self {
        value.map_or(Self::Absent, Self::Set)
    }
}

impl<T: Clone> Field<T> {
    /// Fold this incoming attribute into `stored`.
    pub fn apply_to(&self, stored: &mut Self) {
        match self {
            Self::Absent => {}
            Self::Null => *stored = Self::Absent,
            Self::Set(value) => *stored = Self::Set(value.clone()),
        }
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Set(value) => value.serialize(serializer),
            Self::Absent | Self::Null => serializer.serialize_none(),
        }
    }
}

// A missing key never reaches this impl; fields carry `#[serde(default)]`.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<T>::deserialize(deserializer)?.map_or(Self::Null, Self::Set))
    }
}

/// Stable id as sent by clients: an integer, or a float with no fractional part.
struct WireId(StableId);

struct WireIdVisitor;

impl Visitor<'_> for WireIdVisitor {
    type Value = WireId;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an integral record id")
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<WireId, E> {
        Ok(WireId(value))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<WireId, E> {
        StableId::try_from(value)
            .map(WireId)
            .map_err(|_| E::custom(format!("record id {value} is out of range")))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn visit_f64<E: de::Error>(self, value: f64) -> Result<WireId, E> {
        let in_range = value >= StableId::MIN as f64 && value < StableId::MAX as f64;
        if value.fract() == 0.0 && in_range {
            Ok(WireId(value as StableId))
        } else {
            Err(E::custom(format!("record id {value} is not an integer")))
        }
    }
}

impl<'de> Deserialize<'de> for WireId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(WireIdVisitor)
    }
}

pub(crate) fn stable_id<'de, D>(deserializer: D) -> Result<StableId, D::Error>
where
    D: Deserializer<'de>,
{
    WireId::deserialize(deserializer).map(|WireId(id)| id)
}

pub(crate) fn stable_id_field<'de, D>(deserializer: D) -> Result<Field<StableId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<WireId>::deserialize(deserializer)?.map_or(Field::Null, |WireId(id)| Field::Set(id)))
}
