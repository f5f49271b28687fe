//! Chat host: turns free-text lines into tool calls.
//!
//! Intents are recognised with regular expressions (English and Spanish
//! keywords). Parameters are pulled out of the same line, e.g.
//!
//! ```text
//! select bearing Fr=3500 Fa=500 rpm 1800 L10h 12000 95% oil
//! verify 6205 Fr 1000 rpm=1000 L10h=10000
//! catalog
//! call ping {}
//! ```
//!
//! Every tool call goes through a [`LazyConnection`], so the bearing server
//! is started on first use and restarted after a crash.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::config::HostConfig;
use crate::ipc::{LazyConnection, TransportError};
use crate::models::{CatalogListing, Selection, Verification};

/// Help text shown for `help` and unrecognised input.
pub const HELP: &str = "\
Commands:
  select Fr=<N> [Fa=<N>] rpm=<rpm> L10h=<hours> [95%] [temp=<C>] [oil|grease]
  verify <model> Fr=<N> [Fa=<N>] rpm=<rpm> [L10h=<hours>]
  catalog
  ping
  call <method> [json-params]
  history
  help
  quit";

const NUM: &str = r"([-+]?\d+(?:\.\d+)?)";

/// What the user asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// A bearing tool with fully collected arguments.
    Tool { name: &'static str, arguments: Value },
    /// A bearing tool that still lacks required parameters.
    Incomplete {
        name: &'static str,
        needs: Vec<&'static str>,
    },
    Ping,
    /// Raw method call.
    Call { method: String, params: Value },
    History,
    Help,
    Quit,
    Empty,
    /// Input that could not be understood; carries the reason.
    Unknown(String),
}

struct Patterns {
    quit: Regex,
    help: Regex,
    history: Regex,
    ping: Regex,
    call: Regex,
    select: Regex,
    verify: Regex,
    catalog: Regex,
    model: Regex,
    reliability: Regex,
    oil: Regex,
    grease: Regex,
    numbers: Vec<(&'static str, Regex)>,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        let number = |key: &'static str, pattern: String| Regex::new(&pattern).map(|re| (key, re));
        Ok(Self {
            quit: Regex::new(r"(?i)^(?:quit|exit|salir|q)$")?,
            help: Regex::new(r"(?i)^(?:help|ayuda|\?)$")?,
            history: Regex::new(r"(?i)^(?:history|historial)$")?,
            ping: Regex::new(r"(?i)^ping$")?,
            call: Regex::new(r"(?is)^call\s+(\S+)\s*(.*)$")?,
            select: Regex::new(r"(?i)\b(?:select\w*|selec\w*|choose|elegir|escoger)\b")?,
            verify: Regex::new(r"(?i)\b(?:verif\w*|check)\b")?,
            catalog: Regex::new(r"(?i)\bcat[aá]log\w*\b")?,
            model: Regex::new(r"(?i)\b(NU\d{3,4}|6\d{3})\b")?,
            reliability: Regex::new(&format!(r"{NUM}\s*%"))?,
            oil: Regex::new(r"(?i)\b(?:oil|aceite)\b")?,
            grease: Regex::new(r"(?i)\b(?:grease|grasa)\b")?,
            numbers: vec![
                number("Fr_N", format!(r"(?i)\bFr(?:_N)?\s*[=:]?\s*{NUM}"))?,
                number("Fa_N", format!(r"(?i)\bFa(?:_N)?\s*[=:]?\s*{NUM}"))?,
                number("rpm", format!(r"(?i)\brpm\s*[=:]?\s*{NUM}|{NUM}\s*rpm\b"))?,
                number(
                    "L10h_target",
                    format!(r"(?i)\bL10h(?:_target)?\s*[=:]?\s*{NUM}"),
                )?,
                number(
                    "temperature_C",
                    format!(r"(?i)\b(?:T|temp\w*)\s*[=:]?\s*{NUM}\s*°?C?\b"),
                )?,
            ],
        })
    }
}

fn patterns() -> Result<&'static Patterns, &'static regex::Error> {
    static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();
    PATTERNS.get_or_init(Patterns::compile).as_ref()
}

/// Numeric parameters found in `text`, plus the text with those spans blanked.
fn extract_numbers(p: &Patterns, text: &str) -> (Map<String, Value>, String) {
    let mut found = Map::new();
    let mut masked = text.to_string();
    for (key, re) in &p.numbers {
        let Some(caps) = re.captures(&masked) else {
            continue;
        };
        let value = caps
            .iter()
            .skip(1)
            .flatten()
            .next()
            .and_then(|m| m.as_str().parse::<f64>().ok());
        if let (Some(value), Some(whole)) = (value, caps.get(0)) {
            found.insert(key.to_string(), json!(value));
            let range = whole.range();
            masked.replace_range(range.clone(), &" ".repeat(range.len()));
        }
    }
    (found, masked)
}

fn extract_options(p: &Patterns, text: &str, params: &mut Map<String, Value>) {
    if let Some(percent) = p
        .reliability
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        params.insert("reliability_percent".to_string(), json!(percent.round() as u32));
    }
    if p.oil.is_match(text) {
        params.insert("lubrication".to_string(), json!("oil"));
    } else if p.grease.is_match(text) {
        params.insert("lubrication".to_string(), json!("grease"));
    }
}

fn has_load(params: &Map<String, Value>) -> bool {
    params.contains_key("Fr_N") || params.contains_key("Fa_N")
}

/// Classify one line of user input.
pub fn parse_intent(line: &str) -> Intent {
    let text = line.trim();
    if text.is_empty() {
        return Intent::Empty;
    }
    let p = match patterns() {
        Ok(p) => p,
        Err(e) => return Intent::Unknown(format!("Intent patterns are unavailable: {}", e)),
    };

    if p.quit.is_match(text) {
        return Intent::Quit;
    }
    if p.help.is_match(text) {
        return Intent::Help;
    }
    if p.history.is_match(text) {
        return Intent::History;
    }
    if p.ping.is_match(text) {
        return Intent::Ping;
    }
    if let Some(caps) = p.call.captures(text) {
        let method = caps.get(1).map(|m| m.as_str()).unwrap_or_default().to_string();
        let raw = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        if raw.is_empty() {
            return Intent::Call {
                method,
                params: json!({}),
            };
        }
        return match serde_json::from_str::<Value>(raw) {
            Ok(params) => Intent::Call { method, params },
            Err(e) => Intent::Unknown(format!("Parameters are not valid JSON: {}", e)),
        };
    }

    if p.select.is_match(text) {
        let (mut params, _) = extract_numbers(p, text);
        extract_options(p, text, &mut params);
        let mut needs = Vec::new();
        if !has_load(&params) {
            needs.push("Fr_N or Fa_N");
        }
        if !params.contains_key("rpm") {
            needs.push("rpm");
        }
        if !params.contains_key("L10h_target") {
            needs.push("L10h_target");
        }
        return tool_intent("select_bearing", params, needs);
    }

    if p.verify.is_match(text) {
        let (mut params, masked) = extract_numbers(p, text);
        extract_options(p, text, &mut params);
        if let Some(model) = p.model.captures(&masked).and_then(|c| c.get(1)) {
            params.insert("model".to_string(), json!(model.as_str().to_ascii_uppercase()));
        }
        let mut needs = Vec::new();
        if !params.contains_key("model") {
            needs.push("model");
        }
        if !has_load(&params) {
            needs.push("Fr_N or Fa_N");
        }
        if !params.contains_key("rpm") {
            needs.push("rpm");
        }
        return tool_intent("verify_point", params, needs);
    }

    if p.catalog.is_match(text) {
        return Intent::Tool {
            name: "catalog_list",
            arguments: json!({}),
        };
    }

    Intent::Unknown(format!("Not sure what to do with: {}", text))
}

fn tool_intent(name: &'static str, params: Map<String, Value>, needs: Vec<&'static str>) -> Intent {
    if needs.is_empty() {
        Intent::Tool {
            name,
            arguments: Value::Object(params),
        }
    } else {
        Intent::Incomplete { name, needs }
    }
}

/// Outcome of one input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Message(String),
    Quit,
}

/// One input line and the text shown for it.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub at: DateTime<Local>,
    pub input: String,
    pub reply: String,
}

/// Exchanges kept for the `history` command before the oldest are dropped.
pub const HISTORY_LIMIT: usize = 200;

/// Interactive session state.
pub struct ChatHost {
    connection: LazyConnection,
    history: VecDeque<Exchange>,
}

impl ChatHost {
    pub fn new(connection: LazyConnection) -> Self {
        Self {
            connection,
            history: VecDeque::new(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(LazyConnection::new(
            config.bearingpro.clone(),
            config.timeout,
        ))
    }

    /// The most recent exchanges, oldest first, at most [`HISTORY_LIMIT`].
    pub fn history(&self) -> &VecDeque<Exchange> {
        &self.history
    }

    /// Handle one line of user input.
    pub fn handle_line(&mut self, line: &str) -> Reply {
        let intent = parse_intent(line);
        let text = match intent {
            Intent::Quit => return Reply::Quit,
            Intent::Empty => return Reply::Message(String::new()),
            Intent::History => return Reply::Message(self.render_history()),
            Intent::Help => HELP.to_string(),
            Intent::Unknown(reason) => format!("{}\n\n{}", reason, HELP),
            Intent::Incomplete { name, needs } => {
                format!("{} needs: {}", name, needs.join(", "))
            }
            Intent::Ping => match self.connection.call_result("ping", json!({})) {
                Ok(result) => format!("Server answered: {}", result),
                Err(e) => describe_failure(&e),
            },
            Intent::Call { method, params } => {
                info!("Raw call: {}", method);
                match self.connection.call_result(&method, params) {
                    Ok(result) => pretty(&result),
                    Err(e) => describe_failure(&e),
                }
            }
            Intent::Tool { name, arguments } => {
                info!("Tool call: {}", name);
                let params = json!({"name": name, "arguments": arguments});
                match self.connection.call_result("tools/call", params) {
                    Ok(result) => format_tool_result(name, &result),
                    Err(e) => describe_failure(&e),
                }
            }
        };

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(Exchange {
            at: Local::now(),
            input: line.trim().to_string(),
            reply: text.clone(),
        });
        Reply::Message(text)
    }

    fn render_history(&self) -> String {
        if self.history.is_empty() {
            return "No history yet.".to_string();
        }
        let mut out = String::new();
        for exchange in &self.history {
            let _ = writeln!(out, "[{}] {}", exchange.at.format("%H:%M:%S"), exchange.input);
        }
        out.trim_end().to_string()
    }

    /// Stop the tool server, if one was started.
    pub fn shutdown(&mut self) {
        self.connection.close();
    }
}

impl Drop for ChatHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// User-facing text for a failed call.
pub fn describe_failure(err: &TransportError) -> String {
    warn!("Tool call failed: {}", err);
    match err {
        TransportError::Crashed { .. } => format!(
            "The bearing server crashed; it will be restarted on the next request.\n{}",
            err
        ),
        TransportError::Timeout { .. } => {
            format!("The bearing server did not answer in time.\n{}", err)
        }
        TransportError::Spawn { .. } => format!("Could not start the bearing server.\n{}", err),
        TransportError::Rpc { code, message } => {
            format!("The server rejected the call ({}): {}", code, message)
        }
        other => format!("Transport error: {}", other),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Render a tool result for the terminal.
pub fn format_tool_result(name: &str, result: &Value) -> String {
    if result.get("ok") == Some(&Value::Bool(false)) {
        let reason = result
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return format!("{} refused: {}", name, reason);
    }

    let formatted = match name {
        "select_bearing" => serde_json::from_value::<Selection>(result.clone())
            .ok()
            .map(|s| format_selection(&s)),
        "verify_point" => serde_json::from_value::<Verification>(result.clone())
            .ok()
            .map(|v| format_verification(&v)),
        "catalog_list" => serde_json::from_value::<CatalogListing>(result.clone())
            .ok()
            .map(|c| format_catalog(&c)),
        _ => None,
    };
    formatted.unwrap_or_else(|| pretty(result))
}

fn format_selection(selection: &Selection) -> String {
    let mut out = format!("Equivalent load P = {:.0} N\n", selection.p_equiv_n);
    if selection.candidates.is_empty() {
        out.push_str("No catalog bearing reaches the target life.\n");
    } else {
        let _ = writeln!(
            out,
            "{:<8} {:<20} {:>9} {:>12} {:>9}",
            "Model", "Type", "C [N]", "L10h [h]", "Margin"
        );
        for c in &selection.candidates {
            let _ = writeln!(
                out,
                "{:<8} {:<20} {:>9.0} {:>12.2} {:>8.2}%",
                c.model, c.kind, c.c_n, c.l10h_pred, c.margin_percent
            );
        }
    }
    for note in &selection.notes {
        let _ = writeln!(out, "note: {}", note);
    }
    out.trim_end().to_string()
}

fn format_verification(v: &Verification) -> String {
    let mut out = format!("{} ({}), C = {:.0} N", v.model, v.kind, v.c_n);
    if let (Some(d), Some(outer), Some(width)) = (v.d_mm, v.outer_d_mm, v.width_mm) {
        let _ = write!(out, ", {}x{}x{} mm", d, outer, width);
    }
    let _ = write!(
        out,
        "\nP = {:.0} N, L10h = {:.2} h",
        v.p_equiv_n, v.l10h_pred
    );
    if let (Some(meets), Some(margin)) = (v.meets_target, v.margin_percent) {
        let verdict = if meets { "meets" } else { "misses" };
        let _ = write!(out, "\n{} the target ({:+.2}%)", verdict, margin);
    }
    out
}

fn format_catalog(listing: &CatalogListing) -> String {
    let mut out = format!("{} bearings\n", listing.count);
    for item in &listing.items {
        let _ = writeln!(out, "{:<8} {:<20} C = {:.0} N", item.model, item.kind, item.c_n);
    }
    out.trim_end().to_string()
}
