//! YAML configuration shared by the builder, the tile engine and the CLI.
//!
//! Every field has a default, so an empty document is a valid configuration.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::geometry::Tags;
use crate::query::DEFAULT_QUERY_LIMIT;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// SQLite file holding the feature store.
    pub database: PathBuf,
    pub cache: CacheConfig,
    pub render: RenderConfig,
    pub builder: BuilderConfig,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: PathBuf,
    /// Tiles are persisted only for zoom levels strictly below this value.
    pub max_zoom: u8,
    pub queue_capacity: usize,
    pub jpeg_quality: u8,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    pub resolution: u32,
    pub query_limit: u32,
    pub timeout_ms: Option<u64>,
    /// Stroke widths are in tile units and scale with the resolution.
    pub major_stroke_width: f64,
    pub minor_stroke_width: f64,
    pub major_tags: Vec<TagRule>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct BuilderConfig {
    pub batch_size: usize,
    pub progress_interval: u64,
}

/// Matches a tag by key, and optionally by exact value. Without a value, any
/// non-empty value matches.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct TagRule {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl TagRule {
    pub fn matches(&self, tags: &Tags) -> bool {
        match (tags.get(&self.key), &self.value) {
            (Some(found), Some(expected)) => found == expected,
            (Some(found), None) => !found.is_empty(),
            (None, _) => false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: PathBuf::from("map.db"),
            cache: CacheConfig::default(),
            render: RenderConfig::default(),
            builder: BuilderConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            directory: PathBuf::from("cache"),
            max_zoom: 14,
            queue_capacity: 256,
            jpeg_quality: 80,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            resolution: 256,
            query_limit: DEFAULT_QUERY_LIMIT,
            timeout_ms: None,
            major_stroke_width: 0.003,
            minor_stroke_width: 0.0015,
            major_tags: vec![
                TagRule { key: String::from("highway"), value: None },
                TagRule { key: String::from("class"), value: Some(String::from("major")) },
            ],
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            batch_size: 1000,
            progress_interval: 100_000,
        }
    }
}

impl Config {
    /// Constructs a new Config from a YAML string
    pub fn from_yaml(data: &str) -> Result<Config> {
        if data.trim().is_empty() {
            return Ok(Config::default());
        }

        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let data = fs::read_to_string(path)?;
        Config::from_yaml(&data)
    }
}

impl CacheConfig {
    pub fn is_cacheable(&self, zoom: u8) -> bool {
        zoom < self.max_zoom
    }
}

impl RenderConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_major(&self, tags: &Tags) -> bool {
        self.major_tags.iter().any(|rule| rule.matches(tags))
    }

    pub fn stroke_width(&self, tags: &Tags) -> f64 {
        if self.is_major(tags) {
            self.major_stroke_width
        } else {
            self.minor_stroke_width
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = Config::load("test_data/config.yml").expect("Unable to load the test yml file.");

        assert_eq!(PathBuf::from("data/bavaria.db"), config.database);
        assert_eq!(PathBuf::from("data/tiles"), config.cache.directory);
        assert_eq!(12, config.cache.max_zoom);
        assert_eq!(32, config.cache.queue_capacity);
        assert_eq!(512, config.render.resolution);
        assert_eq!(Some(Duration::from_millis(2500)), config.render.timeout());
        assert_eq!(1, config.render.major_tags.len());
        assert_eq!(500, config.builder.batch_size);

        // Unspecified values fall back to their defaults
        assert_eq!(80, config.cache.jpeg_quality);
        assert_eq!(1000, config.render.query_limit);
        assert_eq!(100_000, config.builder.progress_interval);
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(Config::default(), Config::from_yaml("").unwrap());
        assert_eq!(Config::default(), Config::from_yaml("{}").unwrap());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(Config::from_yaml("render: [unclosed").is_err());
    }

    #[test]
    fn test_cache_cutoff() {
        let cache = CacheConfig::default();
        assert!(cache.is_cacheable(0));
        assert!(cache.is_cacheable(13));
        assert!(!cache.is_cacheable(14));
        assert!(!cache.is_cacheable(18));
    }

    #[test]
    fn test_major_tags() {
        let render = RenderConfig::default();
        let mut tags = Tags::new();
        assert_eq!(render.minor_stroke_width, render.stroke_width(&tags));

        tags.insert(String::from("class"), String::from("minor"));
        assert!(!render.is_major(&tags));

        tags.insert(String::from("class"), String::from("major"));
        assert!(render.is_major(&tags));
        assert_eq!(render.major_stroke_width, render.stroke_width(&tags));

        let mut tags = Tags::new();
        tags.insert(String::from("highway"), String::from("residential"));
        assert!(render.is_major(&tags));

        tags.insert(String::from("highway"), String::new());
        assert!(!render.is_major(&tags));
    }
}
