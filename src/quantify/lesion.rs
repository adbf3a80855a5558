//! Fixed lookup tables shared with report and narrative collaborators.

use serde::{Deserialize, Serialize};

/// Lesion classes of the segmentation network, in channel order.
///
/// Channel 0 of the network is background and has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LesionType {
    /// Hard exudates
    EX,
    /// Hemorrhages
    HE,
    /// Microaneurysms
    MA,
    /// Soft exudates
    SE,
}

impl LesionType {
    /// All lesion classes in channel order.
    pub const ALL: [LesionType; 4] = [LesionType::EX, LesionType::HE, LesionType::MA, LesionType::SE];

    /// Channel index in the probability map (1-based; 0 is background).
    pub const fn class_index(self) -> u8 {
        match self {
            LesionType::EX => 1,
            LesionType::HE => 2,
            LesionType::MA => 3,
            LesionType::SE => 4,
        }
    }

    pub fn from_class_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(LesionType::EX),
            2 => Some(LesionType::HE),
            3 => Some(LesionType::MA),
            4 => Some(LesionType::SE),
            _ => None,
        }
    }

    /// Display color used in colored masks and overlays.
    pub const fn color(self) -> [u8; 3] {
        match self {
            LesionType::EX => [255, 0, 96],
            LesionType::HE => [0, 121, 255],
            LesionType::MA => [0, 223, 162],
            LesionType::SE => [246, 250, 112],
        }
    }

    /// Two-letter code.
    pub const fn code(self) -> &'static str {
        match self {
            LesionType::EX => "EX",
            LesionType::HE => "HE",
            LesionType::MA => "MA",
            LesionType::SE => "SE",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            LesionType::EX => "Hard exudates",
            LesionType::HE => "Hemorrhages",
            LesionType::MA => "Microaneurysms",
            LesionType::SE => "Soft exudates",
        }
    }
}

impl std::fmt::Display for LesionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Connected-component counts per lesion class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LesionCounts {
    #[serde(rename = "EX")]
    pub ex: u32,
    #[serde(rename = "HE")]
    pub he: u32,
    #[serde(rename = "MA")]
    pub ma: u32,
    #[serde(rename = "SE")]
    pub se: u32,
}

impl LesionCounts {
    pub fn get(&self, lesion: LesionType) -> u32 {
        match lesion {
            LesionType::EX => self.ex,
            LesionType::HE => self.he,
            LesionType::MA => self.ma,
            LesionType::SE => self.se,
        }
    }

    pub fn set(&mut self, lesion: LesionType, count: u32) {
        match lesion {
            LesionType::EX => self.ex = count,
            LesionType::HE => self.he = count,
            LesionType::MA => self.ma = count,
            LesionType::SE => self.se = count,
        }
    }

    pub fn total(&self) -> u32 {
        self.ex + self.he + self.ma + self.se
    }
}

/// Five-level diabetic-retinopathy severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrGrade {
    Healthy,
    Mild,
    Moderate,
    Severe,
    Proliferative,
}

impl DrGrade {
    pub const ALL: [DrGrade; 5] = [
        DrGrade::Healthy,
        DrGrade::Mild,
        DrGrade::Moderate,
        DrGrade::Severe,
        DrGrade::Proliferative,
    ];

    pub const fn code(self) -> u8 {
        match self {
            DrGrade::Healthy => 0,
            DrGrade::Mild => 1,
            DrGrade::Moderate => 2,
            DrGrade::Severe => 3,
            DrGrade::Proliferative => 4,
        }
    }

    /// Parse a grade code given as `"0"`..`"4"`.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(DrGrade::Healthy),
            "1" => Some(DrGrade::Mild),
            "2" => Some(DrGrade::Moderate),
            "3" => Some(DrGrade::Severe),
            "4" => Some(DrGrade::Proliferative),
            _ => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            DrGrade::Healthy => "Healthy",
            DrGrade::Mild => "Mild non-proliferative DR (Mild-NPDR)",
            DrGrade::Moderate => "Moderate non-proliferative DR (Moderate-NPDR)",
            DrGrade::Severe => "Severe non-proliferative DR (Severe-NPDR)",
            DrGrade::Proliferative => "Proliferative DR (PDR)",
        }
    }
}

/// Description for a grade code, or `"Unknown"` for anything else.
pub fn severity_text(code: &str) -> &'static str {
    DrGrade::from_code(code).map_or("Unknown", DrGrade::description)
}
