//! Bearing life tools served by the `bearingpro` binary.
//!
//! Life estimates use the basic rating life formula with a few adjustment
//! factors:
//!
//! ```text
//! P     = Fr + Fa
//! L10   = (C / P)^p              [million revolutions], p = 3 (ball) or 10/3 (roller)
//! L10h  = 1e6 * L10 / (60 * rpm) [hours]
//! Lnah  = a1 * a3 * a_lub * L10h
//! ```
//!
//! Bad user input is answered with `{"ok": false, "error": ...}` rather than
//! an RPC error.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::ipc::HandlerTable;
use crate::models::{
    BearingType, Candidate, Catalog, CatalogItem, CatalogListing, Lubrication, OperatingPoint,
    SelectParams, Selection, ToolFailure, ToolInfo, Verification, VerifyParams,
};

/// Protocol version advertised by `initialize`.
pub const TOOL_PROTOCOL_VERSION: &str = "2025-06-18";

const CATALOG_JSON: &str = include_str!("../data/catalog.json");

/// Parse the embedded catalog.
pub fn load_catalog() -> Result<Catalog> {
    serde_json::from_str(CATALOG_JSON).context("Embedded bearing catalog is not valid JSON")
}

/// Equivalent dynamic load [N]. Negative inputs count as zero.
pub fn equivalent_dynamic_load(fr_n: f64, fa_n: f64) -> f64 {
    fr_n.max(0.0) + fa_n.max(0.0)
}

pub fn life_exponent(kind: BearingType) -> f64 {
    if kind.is_roller() {
        10.0 / 3.0
    } else {
        3.0
    }
}

/// Basic rating life in millions of revolutions. Unloaded bearings last forever.
pub fn life_l10(c_n: f64, p_n: f64, kind: BearingType) -> f64 {
    if p_n <= 0.0 {
        return f64::INFINITY;
    }
    (c_n / p_n).powf(life_exponent(kind))
}

/// Convert millions of revolutions to operating hours.
pub fn life_hours(l10_mrev: f64, rpm: f64) -> f64 {
    (1e6 * l10_mrev) / (60.0 * rpm.max(1.0))
}

/// Life adjustment factor a1 for the requested reliability.
pub fn reliability_factor(reliability_percent: u32) -> f64 {
    match reliability_percent {
        90 => 1.0,
        95 => 0.62,
        99 => 0.21,
        _ => 1.0,
    }
}

pub fn temperature_factor(temperature_c: f64) -> f64 {
    if temperature_c <= 70.0 {
        1.0
    } else if temperature_c <= 90.0 {
        0.9
    } else {
        0.8
    }
}

pub fn lubrication_factor(_lubrication: Lubrication) -> f64 {
    1.0
}

/// Adjusted rating life [h] of a bearing at an operating point.
pub fn adjusted_life(c_n: f64, kind: BearingType, point: &OperatingPoint) -> f64 {
    let p = equivalent_dynamic_load(point.fr_n, point.fa_n);
    let l10h = life_hours(life_l10(c_n, p, kind), point.rpm);
    l10h * reliability_factor(point.reliability_percent)
        * temperature_factor(point.temperature_c)
        * lubrication_factor(point.lubrication)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn margin_percent(predicted: f64, target: f64) -> f64 {
    round2((predicted / target - 1.0) * 100.0)
}

/// Descriptors advertised by `initialize`.
pub fn tool_descriptors() -> Vec<ToolInfo> {
    [
        ("select_bearing", "Select catalog bearings that reach a target life at the given loads"),
        ("verify_point", "Verify one catalog model at an operating point"),
        ("catalog_list", "List the bearing catalog"),
    ]
    .into_iter()
    .map(|(name, description)| ToolInfo {
        name: name.to_string(),
        description: description.to_string(),
    })
    .collect()
}

/// The three bearing tools over a loaded catalog.
#[derive(Debug, Clone)]
pub struct Toolbox {
    catalog: Catalog,
}

impl Toolbox {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Toolbox over the embedded catalog.
    pub fn embedded() -> Result<Self> {
        Ok(Self::new(load_catalog()?))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Every catalog bearing whose adjusted life reaches the target, best margin first.
    pub fn select_bearing(&self, params: &SelectParams) -> Result<Selection, ToolFailure> {
        let point = &params.point;
        if !point.is_loaded() || params.l10h_target <= 0.0 {
            return Err(ToolFailure::new(
                "Invalid parameters. Ensure rpm>0, (Fr or Fa)>0, L10h_target>0.",
            ));
        }

        let mut candidates: Vec<Candidate> = self
            .catalog
            .bearings
            .iter()
            .filter_map(|bearing| {
                let predicted = adjusted_life(bearing.c_n, bearing.kind, point);
                (predicted >= params.l10h_target).then(|| Candidate {
                    model: bearing.model.clone(),
                    kind: bearing.kind,
                    c_n: bearing.c_n,
                    l10h_pred: round2(predicted),
                    margin_percent: margin_percent(predicted, params.l10h_target),
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.margin_percent.total_cmp(&a.margin_percent));

        debug!(
            candidates = candidates.len(),
            target = params.l10h_target,
            "select_bearing"
        );

        Ok(Selection {
            ok: true,
            p_equiv_n: round2(equivalent_dynamic_load(point.fr_n, point.fa_n)),
            candidates,
            notes: vec![
                "Simplified P = Fr + Fa (conservative).".to_string(),
                "Reliability and temperature factors are approximations; check the manufacturer catalog."
                    .to_string(),
            ],
        })
    }

    pub fn verify_point(&self, params: &VerifyParams) -> Result<Verification, ToolFailure> {
        let model = params.model.trim();
        if model.is_empty() {
            return Err(ToolFailure::new("Missing 'model'."));
        }
        let bearing = self
            .catalog
            .find(model)
            .ok_or_else(|| ToolFailure::new(format!("Model not found: {}", model)))?;

        let point = &params.point;
        if !point.is_loaded() {
            return Err(ToolFailure::new(
                "Invalid parameters. Ensure rpm>0 and (Fr or Fa)>0.",
            ));
        }
        if matches!(params.l10h_target, Some(target) if target <= 0.0) {
            return Err(ToolFailure::new("L10h_target must be positive."));
        }

        let predicted = adjusted_life(bearing.c_n, bearing.kind, point);
        Ok(Verification {
            ok: true,
            model: bearing.model.clone(),
            kind: bearing.kind,
            c_n: bearing.c_n,
            d_mm: bearing.d_mm,
            outer_d_mm: bearing.outer_d_mm,
            width_mm: bearing.width_mm,
            p_equiv_n: round2(equivalent_dynamic_load(point.fr_n, point.fa_n)),
            l10h_pred: round2(predicted),
            meets_target: params.l10h_target.map(|target| predicted >= target),
            margin_percent: params
                .l10h_target
                .map(|target| margin_percent(predicted, target)),
        })
    }

    pub fn catalog_list(&self) -> CatalogListing {
        let items: Vec<CatalogItem> = self
            .catalog
            .bearings
            .iter()
            .map(|b| CatalogItem {
                model: b.model.clone(),
                kind: b.kind,
                c_n: b.c_n,
            })
            .collect();
        CatalogListing {
            ok: true,
            count: items.len(),
            items,
        }
    }

    /// Run a tool by name. Unknown names are an error; bad arguments are not.
    pub fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
        match name {
            "select_bearing" => {
                let outcome = parse_arguments::<SelectParams>(arguments)
                    .and_then(|params| self.select_bearing(&params));
                to_tool_value(outcome)
            }
            "verify_point" => {
                let outcome = parse_arguments::<VerifyParams>(arguments)
                    .and_then(|params| self.verify_point(&params));
                to_tool_value(outcome)
            }
            "catalog_list" => Ok(serde_json::to_value(self.catalog_list())?),
            other => bail!("Unknown tool: {}", other),
        }
    }
}

fn parse_arguments<T: DeserializeOwned>(arguments: &Value) -> Result<T, ToolFailure> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments)
        .map_err(|e| ToolFailure::new(format!("Invalid parameters: {}", e)))
}

fn to_tool_value<T: Serialize>(outcome: Result<T, ToolFailure>) -> Result<Value> {
    let value = match outcome {
        Ok(result) => serde_json::to_value(result)?,
        Err(failure) => serde_json::to_value(failure)?,
    };
    Ok(value)
}

/// Method table of the bearing tool server.
pub fn handler_table() -> Result<HandlerTable> {
    let toolbox = Arc::new(Toolbox::embedded()?);

    let select = Arc::clone(&toolbox);
    let verify = Arc::clone(&toolbox);
    let list = Arc::clone(&toolbox);
    let dispatch = Arc::clone(&toolbox);

    Ok(HandlerTable::new()
        .register("ping", |_params| Ok(json!({"pong": true})))
        .register("initialize", |_params| {
            Ok(json!({
                "protocolVersion": TOOL_PROTOCOL_VERSION,
                "serverInfo": {
                    "name": "bearingpro",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "tools": tool_descriptors(),
            }))
        })
        .register("tools/call", move |params| {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .context("tools/call requires a string 'name'")?;
            let arguments = params.get("arguments").unwrap_or(&Value::Null);
            dispatch.call_tool(name, arguments)
        })
        .register("catalog_list", move |_params| {
            Ok(serde_json::to_value(list.catalog_list())?)
        })
        .register("select_bearing", move |params| {
            select.call_tool("select_bearing", params)
        })
        .register("verify_point", move |params| {
            verify.call_tool("verify_point", params)
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn toolbox() -> Toolbox {
        Toolbox::embedded().unwrap()
    }

    fn point(fr: f64, fa: f64, rpm: f64) -> OperatingPoint {
        OperatingPoint {
            fr_n: fr,
            fa_n: fa,
            rpm,
            ..OperatingPoint::default()
        }
    }

    #[test]
    fn test_embedded_catalog_loads() {
        let catalog = load_catalog().unwrap();
        assert!(catalog.find("6205").is_some());
        assert!(catalog
            .bearings
            .iter()
            .any(|b| b.kind == BearingType::CylindricalRoller));
    }

    #[test]
    fn test_life_formulas() {
        assert_eq!(equivalent_dynamic_load(3500.0, -200.0), 3500.0);
        assert_eq!(life_l10(14800.0, 0.0, BearingType::DeepGrooveBall), f64::INFINITY);
        assert_eq!(life_l10(2000.0, 1000.0, BearingType::DeepGrooveBall), 8.0);
        let roller = life_l10(2000.0, 1000.0, BearingType::CylindricalRoller);
        assert!((roller - 2f64.powf(10.0 / 3.0)).abs() < 1e-9);
        // 1 million revolutions at 1000 rpm
        assert!((life_hours(1.0, 1000.0) - 16.666_666).abs() < 1e-3);
        // rpm below 1 is clamped
        assert_eq!(life_hours(1.0, 0.0), life_hours(1.0, 1.0));
    }

    #[test]
    fn test_adjustment_factors() {
        assert_eq!(reliability_factor(90), 1.0);
        assert_eq!(reliability_factor(95), 0.62);
        assert_eq!(reliability_factor(99), 0.21);
        assert_eq!(reliability_factor(97), 1.0);
        assert_eq!(temperature_factor(70.0), 1.0);
        assert_eq!(temperature_factor(85.0), 0.9);
        assert_eq!(temperature_factor(120.0), 0.8);
        assert_eq!(lubrication_factor(Lubrication::Oil), 1.0);
    }

    #[test]
    fn test_select_bearing_orders_by_margin() {
        let params = SelectParams {
            point: point(3500.0, 0.0, 1800.0),
            l10h_target: 12000.0,
        };
        let selection = toolbox().select_bearing(&params).unwrap();
        assert!(selection.ok);
        assert_eq!(selection.p_equiv_n, 3500.0);
        assert!(!selection.candidates.is_empty());
        assert!(selection
            .candidates
            .windows(2)
            .all(|w| w[0].margin_percent >= w[1].margin_percent));
        assert!(selection.candidates.iter().all(|c| c.l10h_pred >= 12000.0));
        // 6205 reaches only ~700 h at this point
        assert!(selection.candidates.iter().all(|c| c.model != "6205"));
        assert_eq!(selection.notes.len(), 2);
    }

    #[test]
    fn test_select_bearing_rejects_invalid_input() {
        let params = SelectParams {
            point: point(0.0, 0.0, 1800.0),
            l10h_target: 12000.0,
        };
        let failure = toolbox().select_bearing(&params).unwrap_err();
        assert!(!failure.ok);
        assert!(failure.error.contains("Invalid parameters"));

        let params = SelectParams {
            point: point(1000.0, 0.0, 1800.0),
            l10h_target: 0.0,
        };
        assert!(toolbox().select_bearing(&params).is_err());
    }

    #[test]
    fn test_higher_reliability_shortens_life() {
        let tools = toolbox();
        let base = VerifyParams {
            model: "6206".to_string(),
            point: point(2000.0, 500.0, 1500.0),
            l10h_target: None,
        };
        let mut strict = base.clone();
        strict.point.reliability_percent = 99;

        let base_life = tools.verify_point(&base).unwrap().l10h_pred;
        let strict_life = tools.verify_point(&strict).unwrap().l10h_pred;
        assert!((strict_life - round2(base_life * 0.21)).abs() < 0.05);
    }

    #[test]
    fn test_verify_point_reports_margin() {
        let params = VerifyParams {
            model: "6205".to_string(),
            point: point(1000.0, 0.0, 1000.0),
            l10h_target: Some(10000.0),
        };
        let verification = toolbox().verify_point(&params).unwrap();
        // (14800/1000)^3 = 3241.792 Mrev -> 54029.87 h
        assert_eq!(verification.l10h_pred, 54029.87);
        assert_eq!(verification.meets_target, Some(true));
        assert_eq!(verification.margin_percent, Some(440.3));
        assert_eq!(verification.d_mm, Some(25.0));
        assert_eq!(verification.p_equiv_n, 1000.0);
    }

    #[test]
    fn test_verify_point_without_target_omits_margin() {
        let params = VerifyParams {
            model: "nu205".to_string(),
            point: point(1000.0, 0.0, 1000.0),
            l10h_target: None,
        };
        let value = serde_json::to_value(toolbox().verify_point(&params).unwrap()).unwrap();
        assert_eq!(value["model"], json!("NU205"));
        assert_eq!(value["type"], json!("cylindrical_roller"));
        assert!(value.get("meets_target").is_none());
        assert!(value.get("margin_percent").is_none());
    }

    #[test]
    fn test_verify_point_failures() {
        let tools = toolbox();
        let missing = VerifyParams::default();
        assert_eq!(tools.verify_point(&missing).unwrap_err().error, "Missing 'model'.");

        let unknown = VerifyParams {
            model: "9999".to_string(),
            point: point(1000.0, 0.0, 1000.0),
            l10h_target: None,
        };
        assert_eq!(
            tools.verify_point(&unknown).unwrap_err().error,
            "Model not found: 9999"
        );
    }

    #[test]
    fn test_catalog_list_counts_items() {
        let listing = toolbox().catalog_list();
        assert!(listing.ok);
        assert_eq!(listing.count, listing.items.len());
        assert_eq!(listing.count, load_catalog().unwrap().bearings.len());
    }

    #[test]
    fn test_call_tool_maps_failures_to_records() {
        let tools = toolbox();
        let value = tools
            .call_tool("select_bearing", &json!({"Fr_N": "lots"}))
            .unwrap();
        assert_eq!(value["ok"], json!(false));
        assert!(value["error"].as_str().unwrap().starts_with("Invalid parameters"));

        assert!(tools.call_tool("croesus_xref", &json!({})).is_err());
    }

    #[test]
    fn test_handler_table_methods() {
        let table = handler_table().unwrap();
        assert_eq!(
            table.methods(),
            vec![
                "catalog_list",
                "initialize",
                "ping",
                "select_bearing",
                "tools/call",
                "verify_point"
            ]
        );

        let init = table.dispatch("initialize", &json!({})).unwrap();
        assert_eq!(init["protocolVersion"], json!(TOOL_PROTOCOL_VERSION));
        assert_eq!(init["tools"].as_array().unwrap().len(), 3);

        let listed = table
            .dispatch("tools/call", &json!({"name": "catalog_list", "arguments": {}}))
            .unwrap();
        assert_eq!(listed["ok"], json!(true));

        assert!(table
            .dispatch("tools/call", &json!({"arguments": {}}))
            .is_err());
    }
}
