//! Normalized output model
//!
//! Wire field names follow the vendor CMS convention (`vod_id`,
//! `type_name`, …) — they are part of the external contract, so every
//! rename is explicit. Upstream sources are sloppy about number-vs-string,
//! so scalar fields deserialize from either.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::config::Category;

/// Separator between play sources.
pub const SOURCE_SEP: &str = "$$$";
/// Separator between episodes within a source.
pub const EPISODE_SEP: &str = "#";
/// Separator between an episode name and its URL.
pub const NAME_URL_SEP: &str = "$";

fn flex_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Int(i64),
        Float(f64),
        None,
    }
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::None => String::new(),
    })
}

fn flex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Int(u32),
        Text(String),
        None,
    }
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Int(i) => i,
        Scalar::Text(s) => s.trim().parse().unwrap_or(0),
        Scalar::None => 0,
    })
}

/// Normalized video descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vod {
    #[serde(rename = "vod_id", default, deserialize_with = "flex_string")]
    pub id: String,
    #[serde(rename = "vod_name", default, deserialize_with = "flex_string")]
    pub name: String,
    #[serde(rename = "vod_pic", default, deserialize_with = "flex_string")]
    pub pic: String,
    #[serde(rename = "vod_remarks", default, deserialize_with = "flex_string")]
    pub remarks: String,
    #[serde(rename = "vod_year", default, deserialize_with = "flex_string")]
    pub year: String,
    #[serde(rename = "vod_area", default, deserialize_with = "flex_string")]
    pub area: String,
    #[serde(rename = "vod_actor", default, deserialize_with = "flex_string")]
    pub actor: String,
    #[serde(rename = "vod_director", default, deserialize_with = "flex_string")]
    pub director: String,
    #[serde(rename = "vod_content", default, deserialize_with = "flex_string")]
    pub content: String,
    #[serde(rename = "vod_play_from", default, deserialize_with = "flex_string")]
    pub play_from: String,
    #[serde(rename = "vod_play_url", default, deserialize_with = "flex_string")]
    pub play_url: String,
    #[serde(rename = "type_id", default, deserialize_with = "flex_string")]
    pub type_id: String,
    #[serde(rename = "type_name", default, deserialize_with = "flex_string")]
    pub type_name: String,
    #[serde(rename = "site_key", default, skip_serializing_if = "String::is_empty")]
    pub site_key: String,
}

impl Vod {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Attach the play sources, keeping `vod_play_from` and `vod_play_url`
    /// index-aligned.
    pub fn set_play_sources(&mut self, sources: &[PlaySource]) {
        let (from, url) = encode_play_sources(sources);
        self.play_from = from;
        self.play_url = url;
    }

    pub fn play_sources(&self) -> Vec<PlaySource> {
        decode_play_sources(&self.play_from, &self.play_url)
    }
}

/// One episode: `"<name>$<url>"` on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Episode {
    pub name: String,
    pub url: String,
}

/// One named playback source with its episode list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaySource {
    pub name: String,
    pub episodes: Vec<Episode>,
}

/// Encode sources into the `(vod_play_from, vod_play_url)` pair.
pub fn encode_play_sources(sources: &[PlaySource]) -> (String, String) {
    let from = sources
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(SOURCE_SEP);
    let url = sources
        .iter()
        .map(|s| {
            s.episodes
                .iter()
                .map(|e| format!("{}{}{}", e.name, NAME_URL_SEP, e.url))
                .collect::<Vec<_>>()
                .join(EPISODE_SEP)
        })
        .collect::<Vec<_>>()
        .join(SOURCE_SEP);
    (from, url)
}

/// Decode the `(vod_play_from, vod_play_url)` pair. An episode without the
/// `$` separator keeps its text as both name and URL.
pub fn decode_play_sources(play_from: &str, play_url: &str) -> Vec<PlaySource> {
    if play_from.is_empty() && play_url.is_empty() {
        return Vec::new();
    }
    let names: Vec<&str> = play_from.split(SOURCE_SEP).collect();
    let blocks: Vec<&str> = play_url.split(SOURCE_SEP).collect();

    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let episodes = blocks
                .get(i)
                .map(|block| {
                    block
                        .split(EPISODE_SEP)
                        .filter(|e| !e.is_empty())
                        .map(|entry| match entry.split_once(NAME_URL_SEP) {
                            Some((n, u)) => Episode {
                                name: n.to_string(),
                                url: u.to_string(),
                            },
                            None => Episode {
                                name: entry.to_string(),
                                url: entry.to_string(),
                            },
                        })
                        .collect()
                })
                .unwrap_or_default();
            PlaySource {
                name: (*name).to_string(),
                episodes,
            }
        })
        .collect()
}

/// `homeContent` result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HomeContent {
    #[serde(default)]
    pub class: Vec<Category>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<Vod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

/// `categoryContent` result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryPage {
    #[serde(default)]
    pub list: Vec<Vod>,
    #[serde(default, deserialize_with = "flex_u32")]
    pub page: u32,
    #[serde(default, deserialize_with = "flex_u32")]
    pub pagecount: u32,
    #[serde(default, deserialize_with = "flex_u32")]
    pub limit: u32,
    #[serde(default, deserialize_with = "flex_u32")]
    pub total: u32,
}

/// `detailContent` / `searchContent` result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VodList {
    #[serde(default)]
    pub list: Vec<Vod>,
}

/// `playerContent` result. `parse == 1` means the client must still run a
/// parser on `url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayResult {
    #[serde(default)]
    pub parse: i32,
    #[serde(rename = "playUrl", default, skip_serializing_if = "String::is_empty")]
    pub play_url: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "header", default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flag: String,
}

impl PlayResult {
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            parse: 0,
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn needs_parser(url: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            parse: 1,
            url: url.into(),
            flag: flag.into(),
            ..Self::default()
        }
    }
}
