//! Campaign configuration, read from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) describes a
//! valid campaign over `data/*.tsv` relative to the working directory.

use crate::regressor::{GpConfig, ModelError, RidgeConfig};
use crate::select::{AcquisitionError, AcquisitionScheme, DEFAULT_KMEANS_RESTARTS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the configuration TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize the configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("'{name}' must lie in (0, 1], but is {value}.")]
    InvalidFraction { name: &'static str, value: f64 },
    #[error("'acquisition.n_candidates' must be at least 1.")]
    InvalidCandidateCount,
    #[error("'acquisition.kmeans_restarts' must be at least 1.")]
    InvalidRestarts,
    #[error("'acquisition.rounds' must be at least 1 when set.")]
    InvalidRounds,
    #[error("Invalid model settings: {0}")]
    Model(#[from] ModelError),
}

/// How raw Kd measurements become regression targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelTransform {
    /// `-log10(kd)`, so stronger binders get larger labels.
    #[default]
    NegLog10,
    Identity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub chemicals: PathBuf,
    pub proteins: PathBuf,
    pub affinities: PathBuf,
    pub label_transform: LabelTransform,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            chemicals: PathBuf::from("data/chemicals.tsv"),
            proteins: PathBuf::from("data/proteins.tsv"),
            affinities: PathBuf::from("data/affinities.tsv"),
            label_transform: LabelTransform::default(),
        }
    }
}

/// Fractions of chemicals and proteins whose pairs start out observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub known_chemical_fraction: f64,
    pub known_protein_fraction: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            known_chemical_fraction: 0.5,
            known_protein_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub n_candidates: usize,
    /// Overrides the scheme's default round count.
    pub rounds: Option<usize>,
    pub kmeans_restarts: usize,
    pub seed: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            n_candidates: 10,
            rounds: None,
            kmeans_restarts: DEFAULT_KMEANS_RESTARTS,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub gp: GpConfig,
    pub ridge: RidgeConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub data: DataConfig,
    pub split: SplitConfig,
    pub acquisition: AcquisitionConfig,
    pub model: ModelConfig,
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidFraction { name, value })
    }
}

impl CampaignConfig {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file. Relative data paths are resolved against
    /// the directory containing the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.data.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction(
            "split.known_chemical_fraction",
            self.split.known_chemical_fraction,
        )?;
        check_fraction(
            "split.known_protein_fraction",
            self.split.known_protein_fraction,
        )?;
        if self.acquisition.n_candidates == 0 {
            return Err(ConfigError::InvalidCandidateCount);
        }
        if self.acquisition.kmeans_restarts == 0 {
            return Err(ConfigError::InvalidRestarts);
        }
        if self.acquisition.rounds == Some(0) {
            return Err(ConfigError::InvalidRounds);
        }
        self.model.gp.validate()?;
        self.model.ridge.validate()?;
        Ok(())
    }

    /// Builds the named scheme with this configuration's candidate count.
    pub fn scheme(&self, name: &str) -> Result<AcquisitionScheme, AcquisitionError> {
        AcquisitionScheme::from_name(name, self.acquisition.n_candidates)
            .map(|scheme| scheme.with_kmeans_restarts(self.acquisition.kmeans_restarts))
    }

    /// Rounds to run for `scheme`: the configured override or the scheme default.
    pub fn rounds_for(&self, scheme: &AcquisitionScheme) -> usize {
        self.acquisition
            .rounds
            .unwrap_or_else(|| scheme.default_rounds())
    }
}

impl DataConfig {
    fn resolve_relative_to(&mut self, base: &Path) {
        for path in [&mut self.chemicals, &mut self.proteins, &mut self.affinities] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = CampaignConfig::from_toml_str("").unwrap();
        assert_eq!(config, CampaignConfig::default());
        assert_eq!(config.acquisition.n_candidates, 10);
        assert_eq!(config.acquisition.kmeans_restarts, 3);
        assert_eq!(config.data.label_transform, LabelTransform::NegLog10);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = CampaignConfig::from_toml_str(
            r#"
            [acquisition]
            n_candidates = 4
            rounds = 2

            [data]
            label_transform = "identity"

            [model.gp]
            length_scale = 2.5
            "#,
        )
        .unwrap();
        assert_eq!(config.acquisition.n_candidates, 4);
        assert_eq!(config.acquisition.seed, 1);
        assert_eq!(config.data.label_transform, LabelTransform::Identity);
        assert_eq!(config.model.gp.length_scale, 2.5);
        assert_eq!(config.model.gp.noise_variance, GpConfig::default().noise_variance);
        assert_eq!(config.split, SplitConfig::default());

        let scheme = config.scheme("explore").unwrap();
        assert_eq!(scheme, AcquisitionScheme::Explore { n_candidates: 4 });
        assert_eq!(config.rounds_for(&scheme), 2);
    }

    #[test]
    fn test_scheme_defaults_apply_without_override() {
        let config = CampaignConfig::default();
        let partition = config.scheme("partition").unwrap();
        assert_eq!(
            partition,
            AcquisitionScheme::Partition {
                n_partitions: 10,
                restarts: 3
            }
        );
        assert_eq!(config.rounds_for(&partition), 5);
        assert_eq!(config.rounds_for(&config.scheme("perprot").unwrap()), 30);
        assert!(config.scheme("random").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad_fraction = "[split]\nknown_chemical_fraction = 0.0\n";
        assert!(matches!(
            CampaignConfig::from_toml_str(bad_fraction),
            Err(ConfigError::InvalidFraction { .. })
        ));
        assert!(matches!(
            CampaignConfig::from_toml_str("[acquisition]\nn_candidates = 0\n"),
            Err(ConfigError::InvalidCandidateCount)
        ));
        assert!(matches!(
            CampaignConfig::from_toml_str("[acquisition]\nrounds = 0\n"),
            Err(ConfigError::InvalidRounds)
        ));
        assert!(matches!(
            CampaignConfig::from_toml_str("[model.ridge]\nalpha = -1.0\n"),
            Err(ConfigError::Model(ModelError::InvalidHyperparameter { .. }))
        ));
        assert!(matches!(
            CampaignConfig::from_toml_str("[acquisition\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_load_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("campaign.toml");
        let mut config = CampaignConfig::default();
        config.acquisition.seed = 42;
        config.save(&path).unwrap();

        let loaded = CampaignConfig::load(&path).unwrap();
        assert_eq!(loaded.acquisition.seed, 42);
        assert_eq!(loaded.data.chemicals, dir.path().join("data/chemicals.tsv"));
        assert!(loaded.data.affinities.starts_with(dir.path()));
    }
}
