//! Lenient readers for the UI metadata files shipped with content.

use std::sync::LazyLock;

use ini::Ini;
use regex::Regex;
use serde_json::Value;

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("static regex"));

/// Fields shared by `ui_car.json`, `ui_track.json`, `ui_showroom.json` and `ui_skin.json`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
}

fn decode_text(data: &[u8]) -> String {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    String::from_utf8_lossy(data).into_owned()
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses UI JSON, tolerating a BOM, trailing commas and raw control characters
/// inside strings. `name_field` is `"name"` for most kinds, `"skinname"` for skins.
pub fn parse_ui_json(data: &[u8], name_field: &str) -> Result<UiInfo, String> {
    let text = decode_text(data);
    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => {
            let relaxed: String = text
                .chars()
                .map(|c| if c.is_control() && c != '\n' && c != '\r' && c != '\t' { ' ' } else { c })
                .collect();
            let relaxed = relaxed.replace(['\n', '\r', '\t'], " ");
            let relaxed = TRAILING_COMMA.replace_all(&relaxed, "$1");
            serde_json::from_str(&relaxed).map_err(|e| format!("Invalid JSON: {}", e))?
        }
    };
    if !value.is_object() {
        return Err("UI file does not contain an object".to_string());
    }
    Ok(UiInfo {
        name: string_field(&value, name_field),
        version: string_field(&value, "version"),
        author: string_field(&value, "author"),
    })
}

/// `[LAUNCHER] NAME` from `weather.ini`, or `None` when it is missing or blank
pub fn weather_name(data: &[u8]) -> Result<Option<String>, String> {
    let text = decode_text(data);
    let ini = Ini::load_from_str(&text).map_err(|e| format!("Invalid weather.ini: {}", e))?;
    Ok(ini
        .section(Some("LAUNCHER"))
        .and_then(|section| section.get("NAME"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string))
}
