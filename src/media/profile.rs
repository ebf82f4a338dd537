//! Capture constraint profiles

use std::fmt;

use serde::{Deserialize, Serialize};

/// Camera lens facing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LensFacing {
    /// User-facing camera
    Front,
    /// Environment-facing camera
    Back,
}

impl LensFacing {
    pub fn opposite(self) -> Self {
        match self {
            LensFacing::Front => LensFacing::Back,
            LensFacing::Back => LensFacing::Front,
        }
    }
}

impl Default for LensFacing {
    fn default() -> Self {
        Self::Back
    }
}

impl fmt::Display for LensFacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LensFacing::Front => write!(f, "front"),
            LensFacing::Back => write!(f, "back"),
        }
    }
}

/// Resolution / frame-rate tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Standard,
    High,
}

impl Default for QualityTier {
    fn default() -> Self {
        Self::Standard
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn fits_within(&self, ceiling: Resolution) -> bool {
        self.width <= ceiling.width && self.height <= ceiling.height
    }

    pub fn pixels(&self) -> u32 {
        self.width * self.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Frame rate target and ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub ideal: u32,
    pub max: u32,
}

const CONSTRAINED_CEILING: Resolution = Resolution::new(640, 480);
const CONSTRAINED_MAX_FPS: u32 = 20;
const CONSTRAINED_IDEAL_FPS: u32 = 15;

/// Constraints for one capture request
///
/// Recomputed for every acquisition, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureProfile {
    pub facing: LensFacing,
    pub tier: QualityTier,
    /// Bandwidth-constrained consumer; lowers the ceilings
    pub constrained: bool,
}

impl CaptureProfile {
    pub fn new(facing: LensFacing, tier: QualityTier, constrained: bool) -> Self {
        Self {
            facing,
            tier,
            constrained,
        }
    }

    pub fn with_facing(self, facing: LensFacing) -> Self {
        Self { facing, ..self }
    }

    /// Target (and maximum) resolution
    pub fn resolution(&self) -> Resolution {
        let res = match self.tier {
            QualityTier::Low => Resolution::new(640, 360),
            QualityTier::Standard => Resolution::new(1280, 720),
            QualityTier::High => Resolution::new(1920, 1080),
        };
        if self.constrained {
            Resolution::new(
                res.width.min(CONSTRAINED_CEILING.width),
                res.height.min(CONSTRAINED_CEILING.height),
            )
        } else {
            res
        }
    }

    pub fn frame_rate(&self) -> FrameRate {
        let rate = match self.tier {
            QualityTier::Low => FrameRate { ideal: 15, max: 20 },
            QualityTier::Standard => FrameRate { ideal: 20, max: 30 },
            QualityTier::High => FrameRate { ideal: 30, max: 30 },
        };
        if self.constrained {
            FrameRate {
                ideal: rate.ideal.min(CONSTRAINED_IDEAL_FPS),
                max: rate.max.min(CONSTRAINED_MAX_FPS),
            }
        } else {
            rate
        }
    }
}

impl Default for CaptureProfile {
    fn default() -> Self {
        Self::new(LensFacing::Back, QualityTier::Standard, false)
    }
}
