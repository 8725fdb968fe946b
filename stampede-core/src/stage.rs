use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageKind {
    /// Interpolates linearly from the previous target to this one.
    #[default]
    Ramp,
    /// Holds the target for the whole stage.
    Sustain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
    pub kind: StageKind,
}

impl Stage {
    pub fn ramp(duration: Duration, target: u64) -> Self {
        Self {
            duration,
            target,
            kind: StageKind::Ramp,
        }
    }

    pub fn sustain(duration: Duration, target: u64) -> Self {
        Self {
            duration,
            target,
            kind: StageKind::Sustain,
        }
    }
}
