//! Data models for the bearing tool server.
//!
//! These are the plain records exchanged as tool parameters and results.
//! Field names follow the wire format (`Fr_N`, `L10h_target`, ...) through
//! serde renames.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rolling bearing family.
///
/// Includes `Unknown` variant for forward-compatibility with new families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BearingType {
    DeepGrooveBall,
    AngularContactBall,
    CylindricalRoller,
    TaperedRoller,
    /// Forward-compatible fallback for unknown families
    #[serde(other)]
    Unknown,
}

impl BearingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BearingType::DeepGrooveBall => "deep_groove_ball",
            BearingType::AngularContactBall => "angular_contact_ball",
            BearingType::CylindricalRoller => "cylindrical_roller",
            BearingType::TaperedRoller => "tapered_roller",
            BearingType::Unknown => "unknown",
        }
    }

    /// Roller bearings use a different life exponent than ball bearings.
    pub fn is_roller(&self) -> bool {
        matches!(
            self,
            BearingType::CylindricalRoller | BearingType::TaperedRoller
        )
    }
}

impl fmt::Display for BearingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lubrication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lubrication {
    #[default]
    Grease,
    Oil,
}

impl Lubrication {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lubrication::Grease => "grease",
            Lubrication::Oil => "oil",
        }
    }
}

impl FromStr for Lubrication {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grease" | "grasa" => Ok(Lubrication::Grease),
            "oil" | "aceite" => Ok(Lubrication::Oil),
            other => Err(format!("unknown lubrication: {}", other)),
        }
    }
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bearing {
    pub model: String,
    #[serde(rename = "type")]
    pub kind: BearingType,
    /// Basic dynamic load rating [N].
    #[serde(rename = "C_N")]
    pub c_n: f64,
    #[serde(default)]
    pub d_mm: Option<f64>,
    #[serde(rename = "D_mm", default)]
    pub outer_d_mm: Option<f64>,
    #[serde(rename = "B_mm", default)]
    pub width_mm: Option<f64>,
}

/// Bearing catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub bearings: Vec<Bearing>,
}

impl Catalog {
    /// Find a model by exact (case-insensitive) designation.
    pub fn find(&self, model: &str) -> Option<&Bearing> {
        let wanted = model.trim();
        self.bearings
            .iter()
            .find(|b| b.model.eq_ignore_ascii_case(wanted))
    }
}

fn default_reliability() -> u32 {
    90
}

fn default_temperature() -> f64 {
    25.0
}

/// Operating conditions shared by selection and verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingPoint {
    /// Radial load [N].
    #[serde(rename = "Fr_N", default)]
    pub fr_n: f64,
    /// Axial load [N].
    #[serde(rename = "Fa_N", default)]
    pub fa_n: f64,
    #[serde(default)]
    pub rpm: f64,
    #[serde(default = "default_reliability")]
    pub reliability_percent: u32,
    #[serde(rename = "temperature_C", default = "default_temperature")]
    pub temperature_c: f64,
    #[serde(default)]
    pub lubrication: Lubrication,
}

impl Default for OperatingPoint {
    fn default() -> Self {
        Self {
            fr_n: 0.0,
            fa_n: 0.0,
            rpm: 0.0,
            reliability_percent: default_reliability(),
            temperature_c: default_temperature(),
            lubrication: Lubrication::default(),
        }
    }
}

impl OperatingPoint {
    /// At least one load and a positive speed.
    pub fn is_loaded(&self) -> bool {
        self.rpm > 0.0 && (self.fr_n > 0.0 || self.fa_n > 0.0)
    }
}

/// Parameters of `select_bearing`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectParams {
    #[serde(flatten)]
    pub point: OperatingPoint,
    /// Required adjusted life [h].
    #[serde(rename = "L10h_target", default)]
    pub l10h_target: f64,
}

/// Parameters of `verify_point`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyParams {
    #[serde(default)]
    pub model: String,
    #[serde(flatten)]
    pub point: OperatingPoint,
    #[serde(rename = "L10h_target", default, skip_serializing_if = "Option::is_none")]
    pub l10h_target: Option<f64>,
}

/// A catalog entry that meets the selection target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub model: String,
    #[serde(rename = "type")]
    pub kind: BearingType,
    #[serde(rename = "C_N")]
    pub c_n: f64,
    #[serde(rename = "L10h_pred")]
    pub l10h_pred: f64,
    pub margin_percent: f64,
}

/// Result of `select_bearing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub ok: bool,
    #[serde(rename = "P_equiv_N")]
    pub p_equiv_n: f64,
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Result of `verify_point`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub ok: bool,
    pub model: String,
    #[serde(rename = "type")]
    pub kind: BearingType,
    #[serde(rename = "C_N")]
    pub c_n: f64,
    #[serde(default)]
    pub d_mm: Option<f64>,
    #[serde(rename = "D_mm", default)]
    pub outer_d_mm: Option<f64>,
    #[serde(rename = "B_mm", default)]
    pub width_mm: Option<f64>,
    #[serde(rename = "P_equiv_N")]
    pub p_equiv_n: f64,
    #[serde(rename = "L10h_pred")]
    pub l10h_pred: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meets_target: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_percent: Option<f64>,
}

/// Compact catalog row returned by `catalog_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub model: String,
    #[serde(rename = "type")]
    pub kind: BearingType,
    #[serde(rename = "C_N")]
    pub c_n: f64,
}

/// Result of `catalog_list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogListing {
    pub ok: bool,
    pub count: usize,
    pub items: Vec<CatalogItem>,
}

/// Domain-level refusal (`{"ok": false, "error": ...}`).
///
/// Bad user input is answered with this record rather than an RPC error, so
/// the host can show the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub ok: bool,
    pub error: String,
}

impl ToolFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}

/// Name and description of a tool, as advertised by `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}
