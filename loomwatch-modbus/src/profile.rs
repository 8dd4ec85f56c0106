//! Vendor register profiles.
//!
//! A [`DeviceProfile`] bundles everything that differs between loom controller
//! families: where each semantic field lives in the holding-register space,
//! which register window to read, how stop codes map to [`StopCategory`], which
//! fields are fixed-point encoded, and vendor quirks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TransportKind;

/// Profile tag as it appears in machine configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileTag {
    #[default]
    #[serde(alias = "A")]
    A,
    #[serde(alias = "B")]
    B,
}

impl ProfileTag {
    /// The static profile for this tag.
    pub fn profile(self) -> &'static DeviceProfile {
        match self {
            ProfileTag::A => &PROFILE_A,
            ProfileTag::B => &PROFILE_B,
        }
    }
}

/// Bucket a stop is classified into.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StopCategory {
    Warp,
    Weft,
    Feeder,
    Manual,
    #[default]
    Other,
}

impl StopCategory {
    /// Every category, in reporting order.
    pub const ALL: [StopCategory; 5] = [
        StopCategory::Warp,
        StopCategory::Weft,
        StopCategory::Feeder,
        StopCategory::Manual,
        StopCategory::Other,
    ];

    /// Return the string name for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopCategory::Warp => "warp",
            StopCategory::Weft => "weft",
            StopCategory::Feeder => "feeder",
            StopCategory::Manual => "manual",
            StopCategory::Other => "other",
        }
    }
}

impl std::fmt::Display for StopCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contiguous holding-register range read on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWindow {
    /// First register, 1-based as printed in vendor manuals.
    pub start: u16,
    /// Number of registers.
    pub count: u16,
}

impl RegisterWindow {
    /// Address to put on the wire (0-based).
    pub fn wire_start(&self) -> u16 {
        self.start.saturating_sub(1)
    }
}

/// 0-based addresses of the fields the state machine relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub stop_code: u16,
    pub shift: u16,
    pub speed: u16,
    pub cloth_length: u16,
    pub loom_state: u16,
    pub efficiency: Option<u16>,
}

impl RegisterMap {
    fn required(&self) -> impl Iterator<Item = (&'static str, u16)> {
        [
            ("stop_code", Some(self.stop_code)),
            ("shift", Some(self.shift)),
            ("speed", Some(self.speed)),
            ("cloth_length", Some(self.cloth_length)),
            ("loom_state", Some(self.loom_state)),
            ("efficiency", self.efficiency),
        ]
        .into_iter()
        .filter_map(|(name, addr)| addr.map(|a| (name, a)))
    }
}

/// When a fixed-point rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleCondition {
    Always,
    /// Only when the loom is reached through an RS-485 gateway.
    Rs485Only,
}

/// Fixed-point ×10 encoding of a block of registers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleRule {
    /// First scaled address (0-based, inclusive).
    pub first: u16,
    /// Last scaled address (0-based, inclusive).
    pub last: u16,
    pub divisor: f64,
    pub condition: ScaleCondition,
    /// Address inside the block that is stored unscaled.
    pub passthrough: Option<u16>,
}

impl ScaleRule {
    fn applies(&self, address: u16, transport: TransportKind) -> bool {
        let active = match self.condition {
            ScaleCondition::Always => true,
            ScaleCondition::Rs485Only => transport == TransportKind::Rs485,
        };
        active
            && (self.first..=self.last).contains(&address)
            && self.passthrough != Some(address)
    }
}

/// Errors raised when a response does not fit the profile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Short frame: {actual} registers, profile needs {expected}")]
    Short { expected: usize, actual: usize },
    #[error("Register {address} ({field}) lies outside the read window")]
    OutOfWindow { field: &'static str, address: u16 },
}

/// Raw registers as read from the wire, anchored at their 0-based address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    base: u16,
    registers: Vec<u16>,
}

impl Frame {
    /// Create a frame whose first register sits at `base` (0-based).
    pub fn new(base: u16, registers: Vec<u16>) -> Self {
        Self { base, registers }
    }

    /// Register at a 0-based address, if inside the frame.
    pub fn get(&self, address: u16) -> Option<u16> {
        let index = address.checked_sub(self.base)? as usize;
        self.registers.get(index).copied()
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn registers(&self) -> &[u16] {
        &self.registers
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

/// Semantic fields extracted from a frame, unit-adjusted.
#[derive(Debug, Clone, PartialEq)]
pub struct Fields {
    pub stop_code: u16,
    pub shift: u16,
    pub speed: f64,
    pub cloth_length: f64,
    pub loom_state: u16,
}

impl Fields {
    /// A frame the controller emits before it has meaningful data.
    pub fn is_sentinel(&self) -> bool {
        self.cloth_length == 0.0 && self.loom_state == 0 && self.speed == 0.0
    }
}

/// Static register layout and decode/classify rules of one controller family.
#[derive(Debug)]
pub struct DeviceProfile {
    pub tag: ProfileTag,
    pub name: &'static str,
    pub window: RegisterWindow,
    pub unit_id: u8,
    pub registers: RegisterMap,
    pub scale: ScaleRule,
    /// Decoded speed above which the loom counts as running whatever the stop register says.
    pub speed_override_above: Option<f64>,
    stop_table: &'static [(StopCategory, &'static [u16])],
}

impl DeviceProfile {
    /// Map a stop code to its category. Unknown codes fall back to `Other`.
    pub fn classify(&self, code: u16) -> StopCategory {
        self.stop_table
            .iter()
            .find(|(_, codes)| codes.contains(&code))
            .map(|(category, _)| *category)
            .unwrap_or(StopCategory::Other)
    }

    /// Check that `frame` holds every register this profile reads.
    pub fn validate(&self, frame: &Frame) -> Result<(), FrameError> {
        for (field, address) in self.registers.required() {
            if address < frame.base() {
                return Err(FrameError::OutOfWindow { field, address });
            }
            let expected = (address - frame.base()) as usize + 1;
            if frame.len() < expected {
                return Err(FrameError::Short {
                    expected,
                    actual: frame.len(),
                });
            }
        }
        Ok(())
    }

    /// Unit-adjusted value of the register at `address`.
    pub fn value(&self, frame: &Frame, address: u16, transport: TransportKind) -> Option<f64> {
        let raw = f64::from(frame.get(address)?);
        if self.scale.applies(address, transport) {
            Some(raw / self.scale.divisor)
        } else {
            Some(raw)
        }
    }

    /// Extract the semantic fields from a validated frame.
    pub fn fields(&self, frame: &Frame, transport: TransportKind) -> Result<Fields, FrameError> {
        self.validate(frame)?;
        let map = &self.registers;
        let reg = |address: u16| frame.get(address).unwrap_or_default();
        let val = |address: u16| self.value(frame, address, transport).unwrap_or_default();

        Ok(Fields {
            stop_code: reg(map.stop_code),
            shift: reg(map.shift),
            speed: val(map.speed),
            cloth_length: val(map.cloth_length),
            loom_state: reg(map.loom_state),
        })
    }

    /// Stop code after vendor quirks are applied.
    pub fn effective_stop_code(&self, fields: &Fields) -> u16 {
        match self.speed_override_above {
            Some(threshold) if fields.speed > threshold => 0,
            _ => fields.stop_code,
        }
    }

    /// The whole frame with fixed-point fields divided down.
    pub fn adjust(&self, frame: &Frame, transport: TransportKind) -> Vec<f64> {
        (0..frame.len())
            .filter_map(|offset| {
                let address = frame.base().checked_add(offset as u16)?;
                self.value(frame, address, transport)
            })
            .collect()
    }
}

/// Direct-drive looms with the controller listening on unit 85.
pub static PROFILE_A: DeviceProfile = DeviceProfile {
    tag: ProfileTag::A,
    name: "profile-a",
    window: RegisterWindow {
        start: 5000,
        count: 74,
    },
    unit_id: 85,
    registers: RegisterMap {
        stop_code: 5027,
        shift: 5012,
        speed: 5010,
        cloth_length: 5018,
        loom_state: 5028,
        efficiency: None,
    },
    scale: ScaleRule {
        first: 5035,
        last: 5035,
        divisor: 10.0,
        condition: ScaleCondition::Rs485Only,
        passthrough: None,
    },
    speed_override_above: None,
    stop_table: &[
        (StopCategory::Warp, &[1, 19, 20]),
        (StopCategory::Weft, &[2, 3, 11, 12, 15, 16, 17, 18]),
        (StopCategory::Feeder, &[7]),
        (StopCategory::Manual, &[4, 6]),
    ],
};

/// Retrofit controllers whose stop register lags behind the drive.
pub static PROFILE_B: DeviceProfile = DeviceProfile {
    tag: ProfileTag::B,
    name: "profile-b",
    window: RegisterWindow {
        start: 1001,
        count: 32,
    },
    unit_id: 1,
    registers: RegisterMap {
        stop_code: 1004,
        shift: 1002,
        speed: 1010,
        cloth_length: 1012,
        loom_state: 1005,
        efficiency: Some(1014),
    },
    scale: ScaleRule {
        first: 1012,
        last: 1017,
        divisor: 10.0,
        condition: ScaleCondition::Always,
        passthrough: Some(1014),
    },
    speed_override_above: Some(5.0),
    stop_table: &[
        (StopCategory::Warp, &[10, 11]),
        (StopCategory::Weft, &[20, 21, 22]),
        (StopCategory::Feeder, &[30]),
        (StopCategory::Manual, &[1, 2]),
    ],
};
