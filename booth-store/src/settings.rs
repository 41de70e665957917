//! Session settings and their defaults.
//!
//! Every group derives `serde(default)`, so a stored session that predates a
//! group (or a field inside one) still loads with the default filled in.
//! [`SessionSettings::from_partial`] does the same for arbitrary JSON
//! overrides coming from the UI or the cloud.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    // Overlay (design artwork) placement
    pub position: String,
    pub size: u32,
    pub opacity: u32,

    pub layout: LayoutSettings,
    pub background: BackgroundSettings,
    pub text: TextSettings,
    pub border: BorderSettings,
    pub collage_logo: CollageLogoSettings,
    pub corner_logo: CornerLogoSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            position: "center".to_string(),
            size: 100,
            opacity: 100,
            layout: LayoutSettings::default(),
            background: BackgroundSettings::default(),
            text: TextSettings::default(),
            border: BorderSettings::default(),
            collage_logo: CollageLogoSettings::default(),
            corner_logo: CornerLogoSettings::default(),
        }
    }
}

/// Strip layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LayoutSettings {
    pub orientation: String,
    pub photo_count: u32,
    pub spacing: u32,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            orientation: "horizontal".to_string(),
            photo_count: 3,
            spacing: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BackgroundSettings {
    #[serde(rename = "type")]
    pub kind: String,
    pub color: String,
    pub gradient_start: String,
    pub gradient_end: String,
    pub gradient_direction: String,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            kind: "solid".to_string(),
            color: "#ffffff".to_string(),
            gradient_start: "#ffffff".to_string(),
            gradient_end: "#f0f0f0".to_string(),
            gradient_direction: "to bottom".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TextSettings {
    pub enabled: bool,
    pub content: String,
    pub position: String,
    pub font_size: u32,
    pub font_family: String,
    pub color: String,
    pub show_date: bool,
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            content: String::new(),
            position: "bottom".to_string(),
            font_size: 24,
            font_family: "Arial".to_string(),
            color: "#000000".to_string(),
            show_date: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BorderSettings {
    pub enabled: bool,
    pub width: u32,
    pub color: String,
    pub style: String,
    pub radius: u32,
}

impl Default for BorderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            width: 0,
            color: "#000000".to_string(),
            style: "solid".to_string(),
            radius: 0,
        }
    }
}

/// Logo cell of the 2x2 collage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CollageLogoSettings {
    pub enabled: bool,
    pub image: Option<String>,
    pub background_color: String,
    pub padding: u32,
}

impl Default for CollageLogoSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            image: None,
            background_color: "#ffffff".to_string(),
            padding: 10,
        }
    }
}

/// Small logo stamped into one corner of every capture
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CornerLogoSettings {
    pub enabled: bool,
    pub image: Option<String>,
    pub position: String,
    pub size: u32,
    pub opacity: u32,
    pub margin: u32,
}

impl Default for CornerLogoSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            image: None,
            position: "bottom-right".to_string(),
            size: 15,
            opacity: 100,
            margin: 10,
        }
    }
}

impl SessionSettings {
    /// Builds settings from a (possibly partial) JSON override.
    ///
    /// Nested groups are merged field by field, so overriding `text.color`
    /// keeps the default `text.fontSize`. A `null` or non-object override
    /// yields the defaults.
    pub fn from_partial(overrides: &Value) -> Result<Self, serde_json::Error> {
        let mut merged = serde_json::to_value(Self::default())?;
        deep_merge(&mut merged, overrides);
        serde_json::from_value(merged)
    }

    /// Settings as stored by any client version.
    ///
    /// Never fails: `null` yields the defaults, and override fields with the
    /// wrong type are skipped one by one while the rest still apply.
    pub fn from_stored(raw: &Value) -> Self {
        match Self::from_partial(raw) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Repairing stored session settings: {}", e);
                let mut merged = serde_json::to_value(Self::default()).unwrap_or(Value::Null);
                merge_valid(&mut merged, "", raw);
                serde_json::from_value(merged).unwrap_or_default()
            }
        }
    }

    /// Applies a partial JSON override on top of these settings.
    pub fn merged_with(&self, overrides: &Value) -> Result<Self, serde_json::Error> {
        let mut merged = serde_json::to_value(self)?;
        deep_merge(&mut merged, overrides);
        serde_json::from_value(merged)
    }
}

/// Applies each field of `overlay` under `pointer` only if the result still
/// reads as settings. Unknown keys are ignored.
fn merge_valid(root: &mut Value, pointer: &str, overlay: &Value) {
    let Value::Object(fields) = overlay else {
        return;
    };
    for (key, value) in fields {
        let path = format!("{}/{}", pointer, key.replace('~', "~0").replace('/', "~1"));
        let mut candidate = root.clone();
        let Some(slot) = candidate.pointer_mut(&path) else {
            continue;
        };
        deep_merge(slot, value);

        if serde_json::from_value::<SessionSettings>(candidate.clone()).is_ok() {
            *root = candidate;
        } else if value.is_object() {
            merge_valid(root, &path, value);
        } else {
            log::debug!("Dropping unreadable setting {}: {}", path, value);
        }
    }
}

/// Recursively merges `overlay` into `base`.
///
/// Objects are merged key by key; any other overlay value (including arrays)
/// replaces the base value. `null` in the overlay leaves the base untouched.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        if !overlay_value.is_null() {
                            base_map.insert(key.clone(), overlay_value.clone());
                        }
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_override_is_default() {
        let settings = SessionSettings::from_partial(&json!({})).unwrap();
        assert_eq!(settings, SessionSettings::default());

        let settings = SessionSettings::from_partial(&Value::Null).unwrap();
        assert_eq!(settings, SessionSettings::default());
    }

    #[test]
    fn test_stored_settings_skip_mistyped_fields() {
        let settings = SessionSettings::from_stored(&json!({
            "position": "top",
            "size": "big",
            "border": { "enabled": true, "width": "thick" },
            "text": "not a group"
        }));

        assert_eq!(settings.position, "top");
        assert_eq!(settings.size, 100);
        assert!(settings.border.enabled);
        assert_eq!(settings.border.width, 0);
        assert_eq!(settings.text, SessionSettings::default().text);
        assert_eq!(SessionSettings::from_stored(&Value::Null), SessionSettings::default());
    }

    #[test]
    fn test_nested_override_keeps_siblings() {
        let settings =
            SessionSettings::from_partial(&json!({ "text": { "color": "#ff0000" } })).unwrap();

        assert_eq!(settings.text.color, "#ff0000");
        assert_eq!(settings.text.font_size, 24);
        assert_eq!(settings.text.font_family, "Arial");
        assert_eq!(settings.border, BorderSettings::default());
    }

    #[test]
    fn test_legacy_session_gains_new_groups() {
        // Sessions saved before the logo groups existed
        let legacy = json!({
            "position": "top",
            "size": 80,
            "opacity": 50,
            "layout": { "orientation": "vertical", "photoCount": 4, "spacing": 5 }
        });
        let settings: SessionSettings = serde_json::from_value(legacy).unwrap();

        assert_eq!(settings.position, "top");
        assert_eq!(settings.layout.photo_count, 4);
        assert_eq!(settings.collage_logo, CollageLogoSettings::default());
        assert_eq!(settings.corner_logo, CornerLogoSettings::default());
        assert_eq!(settings.background.kind, "solid");
    }

    #[test]
    fn test_merged_with_existing_settings() {
        let mut base = SessionSettings::default();
        base.layout.spacing = 20;

        let merged = base
            .merged_with(&json!({ "layout": { "photoCount": 4 }, "opacity": 70 }))
            .unwrap();

        assert_eq!(merged.layout.spacing, 20);
        assert_eq!(merged.layout.photo_count, 4);
        assert_eq!(merged.opacity, 70);
    }

    #[test]
    fn test_deep_merge_replaces_scalars_and_arrays() {
        let mut base = json!({ "a": 1, "b": [1, 2], "c": { "d": true } });
        deep_merge(&mut base, &json!({ "a": 2, "b": [3], "c": { "e": false }, "f": null }));

        assert_eq!(base, json!({ "a": 2, "b": [3], "c": { "d": true, "e": false } }));
    }

    #[test]
    fn test_camel_case_wire_names() {
        let value = serde_json::to_value(SessionSettings::default()).unwrap();
        assert!(value.get("collageLogo").is_some());
        assert!(value.get("cornerLogo").is_some());
        assert_eq!(value["background"]["type"], "solid");
        assert_eq!(value["text"]["fontSize"], 24);
    }
}
