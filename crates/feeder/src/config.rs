use std::path::Path;

use anyhow::Context as _;
use scara_geom::ConfigBuilder;
use scara_planner::AxisLimits;
use serde::{Deserialize, Serialize};

use crate::session::SessionConfig;

fn default_geometry() -> scara_geom::Config {
    ConfigBuilder::default().build()
}

/// Everything the feeder needs to know, as stored in its JSON config file.
/// Missing sections get their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeederConfig {
    #[serde(default = "default_geometry")]
    pub geometry: scara_geom::Config,
    #[serde(default)]
    pub limits: AxisLimits,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for FeederConfig {
    fn default() -> Self {
        FeederConfig {
            geometry: default_geometry(),
            limits: AxisLimits::default(),
            session: SessionConfig::default(),
        }
    }
}

impl FeederConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<FeederConfig> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("couldn't parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let cfg: FeederConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, FeederConfig::default());
    }

    #[test]
    fn inverted_limits_are_rejected() {
        let json = r#"{
            "limits": {"minx": 1.0, "maxx": 0.0, "miny": 0.0, "maxy": 1.0, "minz": 0.0, "maxz": 1.0}
        }"#;
        assert!(serde_json::from_str::<FeederConfig>(json).is_err());
    }

    #[test]
    fn round_trip() {
        let mut cfg = FeederConfig::default();
        cfg.session.auth_key = Some(0xdead_beef);
        cfg.geometry.arm1_len = 5.0;
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(serde_json::from_str::<FeederConfig>(&json).unwrap(), cfg);
    }
}
