use crate::error::{AmpError, Result};
use crate::types::ZoneAddress;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

/// Number of attribute fields in a zone enquiry response
pub const ATTRIBUTE_COUNT: usize = 10;

/// Width of every encoded field on the wire
pub const FIELD_WIDTH: usize = 2;

/// Semantic type of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Boolean,
    Integer,
}

impl ValueType {
    fn name(self) -> &'static str {
        match self {
            ValueType::Boolean => "boolean",
            ValueType::Integer => "integer",
        }
    }
}

/// A decoded attribute value
///
/// Serializes to the bare JSON scalar (`true`, `-3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Integer(i32),
}

impl AttributeValue {
    fn value_type(self) -> ValueType {
        match self {
            AttributeValue::Boolean(_) => ValueType::Boolean,
            AttributeValue::Integer(_) => ValueType::Integer,
        }
    }

    fn as_i32(self) -> i32 {
        match self {
            AttributeValue::Boolean(b) => b as i32,
            AttributeValue::Integer(i) => i,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Boolean(b) => write!(f, "{b}"),
            AttributeValue::Integer(i) => write!(f, "{i}"),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        AttributeValue::Integer(i)
    }
}

/// Static description of one zone attribute
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct AttributeDescriptor {
    /// Position in the zone enquiry response
    pub index: usize,
    pub name: &'static str,
    pub value_type: ValueType,
    /// Two character set-command key; `None` for read-only attributes
    pub key: Option<&'static str>,
    /// Added to the wire value when decoding, subtracted when encoding
    pub offset: i32,
    pub min: i32,
    pub max: i32,
}

const fn boolean(index: usize, name: &'static str, key: Option<&'static str>) -> AttributeDescriptor {
    AttributeDescriptor {
        index,
        name,
        value_type: ValueType::Boolean,
        key,
        offset: 0,
        min: 0,
        max: 1,
    }
}

const fn integer(
    index: usize,
    name: &'static str,
    key: &'static str,
    offset: i32,
    min: i32,
    max: i32,
) -> AttributeDescriptor {
    AttributeDescriptor {
        index,
        name,
        value_type: ValueType::Integer,
        key: Some(key),
        offset,
        min,
        max,
    }
}

/// Zone attributes in zone enquiry response order
pub static ZONE_ATTRIBUTES: [AttributeDescriptor; ATTRIBUTE_COUNT] = [
    boolean(0, "public_announcement", None),
    boolean(1, "power", Some("PR")),
    boolean(2, "mute", Some("MU")),
    boolean(3, "do_not_disturb", Some("DT")),
    integer(4, "volume", "VO", 0, 0, 38),
    integer(5, "treble", "TR", -7, -7, 7),
    integer(6, "bass", "BS", -7, -7, 7),
    integer(7, "balance", "BL", -10, -10, 10),
    integer(8, "source", "CH", 0, 1, 6),
    boolean(9, "keypad_connected", None),
];

struct AttributeIndex {
    by_name: HashMap<&'static str, &'static AttributeDescriptor>,
    by_key: HashMap<&'static str, &'static AttributeDescriptor>,
}

fn index() -> &'static AttributeIndex {
    static INDEX: OnceLock<AttributeIndex> = OnceLock::new();
    INDEX.get_or_init(|| AttributeIndex {
        by_name: ZONE_ATTRIBUTES.iter().map(|a| (a.name, a)).collect(),
        by_key: ZONE_ATTRIBUTES
            .iter()
            .filter_map(|a| a.key.map(|key| (key, a)))
            .collect(),
    })
}

impl AttributeDescriptor {
    /// Look up an attribute by its topic name
    pub fn by_name(name: &str) -> Result<&'static AttributeDescriptor> {
        index()
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| AmpError::UnknownAttribute(name.to_string()))
    }

    /// Look up a settable attribute by its protocol key
    pub fn by_key(key: &str) -> Option<&'static AttributeDescriptor> {
        index().by_key.get(key).copied()
    }

    /// Attributes that have a protocol key, in wire order
    pub fn settable() -> impl Iterator<Item = &'static AttributeDescriptor> {
        ZONE_ATTRIBUTES.iter().filter(|a| a.is_settable())
    }

    pub fn is_settable(&self) -> bool {
        self.key.is_some()
    }

    fn range_str(&self) -> String {
        format!("[{},{}]", self.min, self.max)
    }

    fn check(&self, value: AttributeValue) -> Result<()> {
        if value.value_type() != self.value_type {
            return Err(AmpError::TypeMismatch {
                attribute: self.name,
                expected: self.value_type.name(),
            });
        }

        if let AttributeValue::Integer(i) = value {
            if !(self.min..=self.max).contains(&i) {
                return Err(AmpError::ValueOutOfRange {
                    attribute: self.name,
                    value: i as i64,
                    range: self.range_str(),
                });
            }
        }

        Ok(())
    }

    /// Decode a two digit wire field
    pub fn decode(&self, raw: &str) -> Result<AttributeValue> {
        if raw.len() != FIELD_WIDTH || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmpError::InvalidResponse(format!(
                "{}: {raw:?} is not a two digit field",
                self.name
            )));
        }

        let n = raw
            .parse::<i32>()
            .map_err(|e| AmpError::InvalidResponse(format!("{}: {e}", self.name)))?
            + self.offset;

        let value = match self.value_type {
            ValueType::Boolean => match n {
                0 => AttributeValue::Boolean(false),
                1 => AttributeValue::Boolean(true),
                n => {
                    return Err(AmpError::ValueOutOfRange {
                        attribute: self.name,
                        value: n as i64,
                        range: self.range_str(),
                    })
                }
            },
            ValueType::Integer => AttributeValue::Integer(n),
        };

        self.check(value)?;
        Ok(value)
    }

    /// Encode a value as a zero padded two digit wire field
    pub fn encode(&self, value: AttributeValue) -> Result<String> {
        self.check(value)?;
        Ok(format!("{:02}", value.as_i32() - self.offset))
    }

    /// Interpret a JSON payload as a value of this attribute's type
    pub fn value_from_json(&self, json: &serde_json::Value) -> Result<AttributeValue> {
        let mismatch = || AmpError::TypeMismatch {
            attribute: self.name,
            expected: self.value_type.name(),
        };

        let value = match self.value_type {
            ValueType::Boolean => AttributeValue::Boolean(json.as_bool().ok_or_else(mismatch)?),
            ValueType::Integer => {
                let i = json.as_i64().ok_or_else(mismatch)?;
                let i = i32::try_from(i).map_err(|_| AmpError::ValueOutOfRange {
                    attribute: self.name,
                    value: i,
                    range: self.range_str(),
                })?;
                AttributeValue::Integer(i)
            }
        };

        self.check(value)?;
        Ok(value)
    }
}

impl fmt::Display for AttributeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Every attribute value of one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneState {
    values: [AttributeValue; ATTRIBUTE_COUNT],
}

impl ZoneState {
    /// Decode the 10 fixed order fields of an enquiry response
    pub fn decode_fields(fields: &str) -> Result<Self> {
        if fields.len() != ATTRIBUTE_COUNT * FIELD_WIDTH || !fields.is_ascii() {
            return Err(AmpError::InvalidResponse(format!(
                "expected {} attribute digits, got {fields:?}",
                ATTRIBUTE_COUNT * FIELD_WIDTH
            )));
        }

        let mut values = [AttributeValue::Boolean(false); ATTRIBUTE_COUNT];
        for (attribute, value) in ZONE_ATTRIBUTES.iter().zip(values.iter_mut()) {
            let start = attribute.index * FIELD_WIDTH;
            *value = attribute.decode(&fields[start..start + FIELD_WIDTH])?;
        }

        Ok(Self { values })
    }

    /// Re-encode into the 20 character field string of an enquiry response
    pub fn encode_fields(&self) -> Result<String> {
        self.iter()
            .map(|(attribute, value)| attribute.encode(value))
            .collect()
    }

    pub fn get(&self, attribute: &AttributeDescriptor) -> AttributeValue {
        self.values[attribute.index]
    }

    /// Attribute/value pairs in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&'static AttributeDescriptor, AttributeValue)> + '_ {
        ZONE_ATTRIBUTES.iter().zip(self.values.iter().copied())
    }
}

/// State of a set of concrete zones captured by one poll tick
pub type ZoneSnapshot = BTreeMap<ZoneAddress, ZoneState>;

/// Parse one enquiry response frame: `>AZ` followed by the attribute fields
pub fn parse_zone_status(frame: &str) -> Result<(ZoneAddress, ZoneState)> {
    let body = frame
        .strip_prefix('>')
        .ok_or_else(|| AmpError::InvalidResponse(format!("missing '>' prefix in {frame:?}")))?;

    if body.len() < FIELD_WIDTH || !body.is_char_boundary(FIELD_WIDTH) {
        return Err(AmpError::InvalidResponse(format!("truncated zone status {frame:?}")));
    }

    let (zone, fields) = body.split_at(FIELD_WIDTH);
    let address = ZoneAddress::parse_zone(zone)
        .map_err(|e| AmpError::InvalidResponse(format!("invalid zone id from amp: {e}")))?;

    Ok((address, ZoneState::decode_fields(fields)?))
}
