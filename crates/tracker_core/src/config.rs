use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const DEFAULT_NAME_MATCH_THRESHOLD: f64 = 0.70;
pub const DEFAULT_ROSTER_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct Settings {
    pub config: TrackerConfig,
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub general: GeneralConfig,
    pub identity: IdentityConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub cache_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub workers: usize,
    pub fetch_attempts: usize,
    pub retry_backoff_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            http_timeout_secs: 30,
            workers: 4,
            fetch_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub name_match_threshold: f64,
    pub roster_ttl_days: i64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name_match_threshold: DEFAULT_NAME_MATCH_THRESHOLD,
            roster_ttl_days: DEFAULT_ROSTER_TTL_DAYS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub default_days: i64,
    pub vote_scan_lines: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_days: 365,
            vote_scan_lines: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectConfig {
    pub key: String,          // e.g. "kafka"
    pub prefix: String,       // e.g. "KIP"
    pub mailing_list: String, // e.g. "dev"
    pub domain: String,       // e.g. "kafka.apache.org"
    pub keys_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ProjectsFile {
    projects: Vec<ProjectConfig>,
}

impl Settings {
    pub fn load_from_dir(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let config_path = path.join("tracker.toml");
        let config = if config_path.exists() {
            let config_str = fs::read_to_string(&config_path)?;
            toml::from_str::<TrackerConfig>(&config_str)?
        } else {
            TrackerConfig::default()
        };

        let projects_path = path.join("projects.yaml");
        let projects = if projects_path.exists() {
            let projects_str = fs::read_to_string(&projects_path)?;
            serde_yaml::from_str::<ProjectsFile>(&projects_str)?.projects
        } else {
            default_projects()
        };

        let settings = Self { config, projects };
        settings.validate()?;
        Ok(settings)
    }

    pub fn project(&self, key: &str) -> Result<&ProjectConfig, ConfigError> {
        self.projects
            .iter()
            .find(|project| project.key.eq_ignore_ascii_case(key))
            .ok_or_else(|| ConfigError::UnknownProject(key.to_string()))
    }

    pub fn project_dir(&self, project: &ProjectConfig) -> PathBuf {
        self.config.general.cache_dir.join(&project.key)
    }

    pub fn archives_dir(&self, project: &ProjectConfig) -> PathBuf {
        self.project_dir(project).join("archives")
    }

    pub fn roster_path(&self, project: &ProjectConfig) -> PathBuf {
        self.project_dir(project).join("committers.json")
    }

    pub fn store_path(&self, project: &ProjectConfig) -> PathBuf {
        self.project_dir(project).join(crate::store::STORE_FILE)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.config.identity.name_match_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                key: "identity.name_match_threshold",
                reason: format!("{threshold} is outside 0.0..=1.0"),
            });
        }
        if self.config.general.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "general.workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.config.general.fetch_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "general.fetch_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        for project in &self.projects {
            if project.prefix.is_empty() || !project.prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::Invalid {
                    key: "projects.prefix",
                    reason: format!("{:?} must be non-empty and alphanumeric", project.prefix),
                });
            }
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config: TrackerConfig::default(),
            projects: default_projects(),
        }
    }
}

fn default_projects() -> Vec<ProjectConfig> {
    vec![
        ProjectConfig {
            key: "kafka".to_string(),
            prefix: "KIP".to_string(),
            mailing_list: "dev".to_string(),
            domain: "kafka.apache.org".to_string(),
            keys_url: "https://downloads.apache.org/kafka/KEYS".to_string(),
        },
        ProjectConfig {
            key: "flink".to_string(),
            prefix: "FLIP".to_string(),
            mailing_list: "dev".to_string(),
            domain: "flink.apache.org".to_string(),
            keys_url: "https://downloads.apache.org/flink/KEYS".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dir_uses_defaults() {
        let settings = Settings::load_from_dir(Path::new("/definitely/not/here")).unwrap();
        assert_eq!(settings.config.identity.name_match_threshold, 0.70);
        assert_eq!(settings.config.identity.roster_ttl_days, 7);
        assert_eq!(settings.project("KAFKA").unwrap().prefix, "KIP");
        assert!(settings.project("spark").is_err());

        let kafka = settings.project("kafka").unwrap();
        assert_eq!(settings.roster_path(kafka), PathBuf::from("cache/kafka/committers.json"));
        assert_eq!(settings.archives_dir(kafka), PathBuf::from("cache/kafka/archives"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("tracker.toml"),
            "[identity]\nname_match_threshold = 0.8\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("projects.yaml"),
            "projects:\n  - key: spark\n    prefix: SPIP\n    mailing_list: dev\n    domain: spark.apache.org\n    keys_url: https://downloads.apache.org/spark/KEYS\n",
        )
        .unwrap();

        let settings = Settings::load_from_dir(dir.path()).unwrap();
        assert_eq!(settings.config.identity.name_match_threshold, 0.8);
        assert_eq!(settings.config.identity.roster_ttl_days, 7);
        assert_eq!(settings.config.general.workers, 4);
        assert_eq!(settings.projects.len(), 1);
        assert_eq!(settings.project("spark").unwrap().domain, "spark.apache.org");
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("tracker.toml"),
            "[identity]\nname_match_threshold = 70.0\n",
        )
        .unwrap();
        assert!(Settings::load_from_dir(dir.path()).is_err());
    }
}
