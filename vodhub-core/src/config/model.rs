//! Config document model
//!
//! Field names follow the external JSON contract: a config document carries
//! `{spider, wallpaper, sites, parses, flags, ads, notice}`. Site `ext` may be
//! a string or an arbitrary JSON object; `header` may be an object, a
//! `k:v; k:v` string, or newline-separated pairs. All of those forms are
//! accepted on input and normalized here.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Site adapter kind as declared in the config document.
///
/// The spider manager may override this from URL heuristics; the declared
/// type is a hint, not the final word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum SiteType {
    Cms,
    Spider,
    App,
    Alist,
}

impl From<i64> for SiteType {
    fn from(v: i64) -> Self {
        match v {
            3 => Self::Spider,
            2 => Self::App,
            4 => Self::Alist,
            _ => Self::Cms,
        }
    }
}

impl From<SiteType> for i64 {
    fn from(v: SiteType) -> Self {
        match v {
            SiteType::Cms => 1,
            SiteType::App => 2,
            SiteType::Spider => 3,
            SiteType::Alist => 4,
        }
    }
}

impl Default for SiteType {
    fn default() -> Self {
        Self::Cms
    }
}

/// A category (home class entry) attached to a site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    #[serde(rename = "type_id", default)]
    pub id: String,
    #[serde(rename = "type_name", default)]
    pub name: String,
    #[serde(rename = "type_flag", default, skip_serializing_if = "String::is_empty")]
    pub flag: String,
}

/// Opaque per-site extension config: either a plain string (usually a URL)
/// or a structured JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtValue {
    Text(String),
    Object(serde_json::Value),
}

impl ExtValue {
    /// String form handed to script spiders: text verbatim, objects
    /// re-serialized.
    pub fn as_passthrough(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Object(v) => v.to_string(),
        }
    }

    pub fn as_object(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Object(v) => Some(v),
            Self::Text(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Object(v) => v.is_null(),
        }
    }
}

/// Headers in any of the accepted wire forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderSpec {
    Map(HashMap<String, String>),
    Text(String),
}

impl HeaderSpec {
    /// Normalize to a map. Text forms accept `k:v; k:v` and newline-separated
    /// `k:v` pairs; malformed pairs are skipped.
    pub fn to_map(&self) -> HashMap<String, String> {
        match self {
            Self::Map(m) => m.clone(),
            Self::Text(s) => s
                .split(|c| c == ';' || c == '\n')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once(':')?;
                    let k = k.trim();
                    let v = v.trim();
                    if k.is_empty() {
                        return None;
                    }
                    Some((k.to_string(), v.to_string()))
                })
                .collect(),
        }
    }
}

fn de_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
        Flag::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
    })
}

fn default_true() -> bool {
    true
}

/// A registered site.
///
/// Immutable after config install; identity is `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub site_type: SiteType,
    #[serde(rename = "api", default)]
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<ExtValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jar: Option<String>,
    #[serde(default = "default_true", deserialize_with = "de_flag")]
    pub searchable: bool,
    #[serde(rename = "quickSearch", default, deserialize_with = "de_flag")]
    pub quick_searchable: bool,
    #[serde(default = "default_true", deserialize_with = "de_flag")]
    pub filterable: bool,
    #[serde(default, deserialize_with = "de_flag")]
    pub changeable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderSpec>,
    /// Per-site operation timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<Category>,
}

impl Site {
    pub fn headers(&self) -> HashMap<String, String> {
        self.header.as_ref().map(HeaderSpec::to_map).unwrap_or_default()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.map_or(15_000, |s| s.saturating_mul(1000))
    }

    pub fn ext_passthrough(&self) -> String {
        self.ext.as_ref().map(ExtValue::as_passthrough).unwrap_or_default()
    }
}

/// Play-URL resolver kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ParserType {
    Sniff,
    Json,
    ExtJson,
    Mix,
    God,
}

impl From<i64> for ParserType {
    fn from(v: i64) -> Self {
        match v {
            1 => Self::Json,
            2 => Self::ExtJson,
            3 => Self::Mix,
            4 => Self::God,
            _ => Self::Sniff,
        }
    }
}

impl From<ParserType> for i64 {
    fn from(v: ParserType) -> Self {
        match v {
            ParserType::Sniff => 0,
            ParserType::Json => 1,
            ParserType::ExtJson => 2,
            ParserType::Mix => 3,
            ParserType::God => 4,
        }
    }
}

impl Default for ParserType {
    fn default() -> Self {
        Self::Sniff
    }
}

/// A remote/scripted play-URL resolver; identity is `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parser {
    pub name: String,
    #[serde(rename = "type", default)]
    pub parser_type: ParserType,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<ParserExt>,
}

/// Parser extension block: the flags a parser claims plus extra headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserExt {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flag: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderSpec>,
}

impl Parser {
    pub fn headers(&self) -> HashMap<String, String> {
        let mut map = self.header.as_ref().map(HeaderSpec::to_map).unwrap_or_default();
        if let Some(ext) = &self.ext {
            if let Some(h) = &ext.header {
                map.extend(h.to_map());
            }
        }
        map
    }

    /// Whether this parser claims the given play flag.
    pub fn claims_flag(&self, flag: &str) -> bool {
        self.ext
            .as_ref()
            .map(|e| e.flag.iter().any(|f| f == flag))
            .unwrap_or(false)
    }
}

/// The whole config document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDoc {
    /// Auxiliary native-spider module URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallpaper: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    #[serde(default)]
    pub sites: Vec<Site>,
    #[serde(default)]
    pub parses: Vec<Parser>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    /// Ad host patterns; responses from matching hosts are dropped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ads: Vec<String>,
}

impl ConfigDoc {
    pub fn site(&self, key: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.key == key)
    }

    pub fn parser(&self, name: &str) -> Option<&Parser> {
        self.parses.iter().find(|p| p.name == name)
    }
}

/// An installed config: the document plus its epoch identity.
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub epoch: u64,
    pub doc: ConfigDoc,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_text_forms_parse() {
        let semi = HeaderSpec::Text("User-Agent: okhttp/3.15; Referer: https://a.example/".into());
        let map = semi.to_map();
        assert_eq!(map.get("User-Agent").map(String::as_str), Some("okhttp/3.15"));
        assert_eq!(map.get("Referer").map(String::as_str), Some("https://a.example/"));

        let newline = HeaderSpec::Text("Cookie: a=1\nOrigin: https://b.example".into());
        let map = newline.to_map();
        assert_eq!(map.get("Cookie").map(String::as_str), Some("a=1"));
        assert_eq!(map.get("Origin").map(String::as_str), Some("https://b.example"));
    }

    #[test]
    fn site_flags_accept_ints_and_bools() {
        let site: Site = serde_json::from_value(serde_json::json!({
            "key": "demo",
            "name": "Demo",
            "type": 1,
            "api": "https://demo/api.php/provide/vod/",
            "searchable": 1,
            "quickSearch": true,
            "filterable": "0"
        }))
        .expect("site should deserialize");
        assert!(site.searchable);
        assert!(site.quick_searchable);
        assert!(!site.filterable);
        assert_eq!(site.site_type, SiteType::Cms);
    }

    #[test]
    fn ext_accepts_string_or_object() {
        let s: Site = serde_json::from_value(serde_json::json!({
            "key": "a", "api": "x", "ext": "https://cfg.example/x.json"
        }))
        .expect("string ext");
        assert_eq!(s.ext_passthrough(), "https://cfg.example/x.json");

        let s: Site = serde_json::from_value(serde_json::json!({
            "key": "b", "api": "x", "ext": {"selector": {"list": "div.item"}}
        }))
        .expect("object ext");
        assert!(s.ext.as_ref().and_then(|e| e.as_object()).is_some());
    }

    #[test]
    fn config_round_trips_modulo_field_order() {
        let doc: ConfigDoc = serde_json::from_value(serde_json::json!({
            "spider": "https://jar.example/spider.jar",
            "wallpaper": "https://img.example/bg.jpg",
            "sites": [
                {"key": "demo", "name": "Demo", "type": 1, "api": "https://demo/api/"},
                {"key": "xp", "name": "XP", "type": 3, "api": "https://xp.example/",
                 "ext": {"list": "ul li"}}
            ],
            "parses": [
                {"name": "Json parser", "type": 1, "url": "https://jx.example/?url="}
            ],
            "ads": ["ads.example.com"]
        }))
        .expect("doc should parse");

        let text = serde_json::to_string(&doc).expect("serialize");
        let again: ConfigDoc = serde_json::from_str(&text).expect("reparse");
        assert_eq!(doc, again);
    }
}
