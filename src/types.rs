use crate::error::{AmpError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Amp number (1-3)
pub type AmpId = u8;

/// Zone number within an amp (1-6)
pub type ZoneNumber = u8;

/// Source input number (1-6)
pub type SourceId = u8;

pub const VALID_AMPS: RangeInclusive<AmpId> = 1..=3;
pub const VALID_ZONES: RangeInclusive<ZoneNumber> = 1..=6;
pub const VALID_SOURCES: RangeInclusive<SourceId> = 1..=6;

/// What part of an amp an address refers to
///
/// `AllZonesOfAmp` is declared first so it orders before any single zone
/// (the wire form uses zone `0` for it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    AllZonesOfAmp,
    SingleZone(ZoneNumber),
}

/// Address of a single zone, or of every zone on one amp
///
/// The wire and config form is two digits `AZ`: `11` is amp 1 zone 1,
/// `10` is all zones of amp 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZoneAddress {
    amp: AmpId,
    scope: Scope,
}

impl ZoneAddress {
    /// Address a single zone
    pub fn zone(amp: AmpId, zone: ZoneNumber) -> Result<Self> {
        check_amp(amp)?;
        if !VALID_ZONES.contains(&zone) {
            return Err(AmpError::InvalidAddress(format!(
                "amp {amp} zone {zone} is not within accepted range [{}, {}]",
                VALID_ZONES.start(),
                VALID_ZONES.end()
            )));
        }

        Ok(Self {
            amp,
            scope: Scope::SingleZone(zone),
        })
    }

    /// Address every zone of an amp
    pub fn amp(amp: AmpId) -> Result<Self> {
        check_amp(amp)?;
        Ok(Self {
            amp,
            scope: Scope::AllZonesOfAmp,
        })
    }

    /// Build from the two-digit integer form (`0` zone digit selects all zones)
    pub fn from_int(id: u32) -> Result<Self> {
        if id > 99 {
            return Err(AmpError::InvalidAddress(id.to_string()));
        }

        let (amp, zone) = ((id / 10) as u8, (id % 10) as u8);
        if zone == 0 {
            Self::amp(amp)
        } else {
            Self::zone(amp, zone)
        }
    }

    /// Parse a single-zone address, rejecting the all-zones form
    pub fn parse_zone(s: &str) -> Result<Self> {
        let address: Self = s.parse()?;
        if address.is_all_zones() {
            return Err(AmpError::InvalidAddress(format!(
                "{s} addresses all zones of amp {}, expected a single zone",
                address.amp
            )));
        }
        Ok(address)
    }

    /// The amp number
    pub fn amp_id(&self) -> AmpId {
        self.amp
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Zone number, or `None` for an all-zones address
    pub fn zone_number(&self) -> Option<ZoneNumber> {
        match self.scope {
            Scope::SingleZone(zone) => Some(zone),
            Scope::AllZonesOfAmp => None,
        }
    }

    pub fn is_all_zones(&self) -> bool {
        self.scope == Scope::AllZonesOfAmp
    }

    /// The all-zones address of the amp hosting this address
    pub fn amp_address(&self) -> Self {
        Self {
            amp: self.amp,
            scope: Scope::AllZonesOfAmp,
        }
    }

    /// Expand to the concrete zones this address covers
    pub fn zones(&self) -> Vec<ZoneAddress> {
        match self.scope {
            Scope::SingleZone(_) => vec![*self],
            Scope::AllZonesOfAmp => VALID_ZONES
                .map(|zone| ZoneAddress {
                    amp: self.amp,
                    scope: Scope::SingleZone(zone),
                })
                .collect(),
        }
    }

    /// Topic path fragment: `amps/{a}/zones/{z}` or `amps/{a}`
    pub fn topic_fragment(&self) -> String {
        match self.scope {
            Scope::SingleZone(zone) => format!("amps/{}/zones/{}", self.amp, zone),
            Scope::AllZonesOfAmp => format!("amps/{}", self.amp),
        }
    }

    /// Two-digit integer form
    pub fn as_int(&self) -> u32 {
        self.amp as u32 * 10 + self.zone_number().unwrap_or(0) as u32
    }
}

fn check_amp(amp: AmpId) -> Result<()> {
    if !VALID_AMPS.contains(&amp) {
        return Err(AmpError::InvalidAddress(format!(
            "amp {amp} is not within accepted range [{}, {}]",
            VALID_AMPS.start(),
            VALID_AMPS.end()
        )));
    }
    Ok(())
}

impl fmt::Display for ZoneAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amp, self.zone_number().unwrap_or(0))
    }
}

impl FromStr for ZoneAddress {
    type Err = AmpError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmpError::InvalidAddress(format!("{s:?} is not a two digit zone id")));
        }

        let id: u32 = s
            .parse()
            .map_err(|_| AmpError::InvalidAddress(s.to_string()))?;
        Self::from_int(id)
    }
}

impl TryFrom<u32> for ZoneAddress {
    type Error = AmpError;

    fn try_from(id: u32) -> Result<Self> {
        Self::from_int(id)
    }
}

/// Baud rates the amp supports, ascending
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
    B230400,
}

impl BaudRate {
    /// All supported rates in ascending order
    pub const ALL: [BaudRate; 6] = [
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
        BaudRate::B230400,
    ];

    /// Rate the amp uses after power on
    pub const DEFAULT: BaudRate = BaudRate::B9600;

    pub fn max() -> BaudRate {
        BaudRate::B230400
    }

    pub fn value(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
            BaudRate::B230400 => 230400,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = AmpError;

    fn try_from(value: u32) -> Result<Self> {
        BaudRate::ALL
            .into_iter()
            .find(|rate| rate.value() == value)
            .ok_or(AmpError::UnsupportedBaud(value))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.value()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}
