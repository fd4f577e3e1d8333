//! TOML persistence for fitted event-based models.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::likelihood::is_valid_ordering;

use super::fit::EbmModel;

const FORMAT_VERSION: u32 = 1;

/// Errors raised while saving or loading a model artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML model file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize model to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unsupported model format version {found}; expected {expected}")]
    UnsupportedVersion { expected: u32, found: u32 },
    #[error("inconsistent model artifact: {0}")]
    Inconsistent(&'static str),
}

#[derive(Serialize)]
struct ArtifactRef<'a> {
    format_version: u32,
    model: &'a EbmModel,
}

#[derive(Deserialize)]
struct Artifact {
    format_version: u32,
    model: EbmModel,
}

impl EbmModel {
    /// # Errors
    ///
    /// Returns `ArtifactError::Serialize` if the model cannot be encoded.
    pub fn to_toml_string(&self) -> Result<String, ArtifactError> {
        Ok(toml::to_string_pretty(&ArtifactRef {
            format_version: FORMAT_VERSION,
            model: self,
        })?)
    }

    /// # Errors
    ///
    /// Returns `ArtifactError` if the TOML is malformed, written by another
    /// format version, or describes an inconsistent model.
    pub fn from_toml_str(source: &str) -> Result<Self, ArtifactError> {
        let artifact: Artifact = toml::from_str(source)?;
        if artifact.format_version != FORMAT_VERSION {
            return Err(ArtifactError::UnsupportedVersion {
                expected: FORMAT_VERSION,
                found: artifact.format_version,
            });
        }
        artifact.model.check_consistency()?;
        Ok(artifact.model)
    }

    /// Save the model as TOML.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError` on serialization or I/O failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ArtifactError> {
        let toml_string = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Load a model saved with [`EbmModel::save`].
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError` on I/O, parse, or consistency failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }

    fn check_consistency(&self) -> Result<(), ArtifactError> {
        let n_events = self.mixtures.len();
        if n_events == 0 {
            return Err(ArtifactError::Inconsistent("model has no mixtures"));
        }
        if self.biomarker_names.len() != n_events {
            return Err(ArtifactError::Inconsistent(
                "biomarker names do not match mixtures",
            ));
        }
        if !is_valid_ordering(&self.ordering, n_events) {
            return Err(ArtifactError::Inconsistent("ordering is not a permutation"));
        }
        if self
            .samples
            .iter()
            .any(|sample| !is_valid_ordering(&sample.ordering, n_events))
        {
            return Err(ArtifactError::Inconsistent(
                "sampled ordering is not a permutation",
            ));
        }
        if self.mixtures.iter().any(|mixture| {
            mixture.grid.len() < 2
                || mixture.grid.len() != mixture.grid_probabilities.len()
                || mixture.pre_event.is_empty()
                || mixture.post_event.is_empty()
        }) {
            return Err(ArtifactError::Inconsistent("mixture grid or kernels are malformed"));
        }
        if self.staging.validate(n_events).is_err() {
            return Err(ArtifactError::Inconsistent("stage prior does not match events"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use faer::Mat;

    use super::*;
    use crate::inference::McmcConfig;
    use crate::input::{BiomarkerData, Direction, GroupLabel};
    use crate::models::ebm::fit::fit_ebm;
    use crate::models::ebm::types::EbmConfig;
    use crate::utils::usize_to_f64;

    fn small_model() -> EbmModel {
        let measurements = Mat::from_fn(30, 2, |row, col| {
            let base = if row >= 10 && col <= row % 3 { 4.0 } else { 0.0 };
            base + usize_to_f64((row + col) % 4) * 0.2
        });
        let labels = (0..30)
            .map(|row| if row < 10 { GroupLabel::Control } else { GroupLabel::Patient })
            .collect();
        let data = BiomarkerData::new(measurements, vec![Direction::Increase; 2])
            .with_labels(labels)
            .with_names(vec!["first".to_string(), "second".to_string()]);
        let config = EbmConfig {
            mcmc: McmcConfig {
                iterations: 60,
                burn_in: 10,
                thin: 5,
                chains: 1,
                ..McmcConfig::default()
            },
            ..EbmConfig::default()
        };
        fit_ebm(&data, &config).expect("fit").model
    }

    #[test]
    fn round_trip_preserves_model() {
        let model = small_model();
        let encoded = model.to_toml_string().expect("encode");
        let decoded = EbmModel::from_toml_str(&encoded).expect("decode");
        assert_eq!(decoded, model);
        let query = Mat::from_fn(3, 2, |row, col| usize_to_f64(row + col) * 1.7);
        let restored = decoded.probabilities(&query).expect("decoded");
        let original = model.probabilities(&query).expect("original");
        for row in 0..3 {
            for col in 0..2 {
                assert_eq!(restored[(row, col)].to_bits(), original[(row, col)].to_bits());
            }
        }
    }

    #[test]
    fn rejects_other_format_versions() {
        let encoded = small_model()
            .to_toml_string()
            .expect("encode")
            .replacen("format_version = 1", "format_version = 99", 1);
        assert!(matches!(
            EbmModel::from_toml_str(&encoded),
            Err(ArtifactError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn rejects_inconsistent_ordering() {
        let mut model = small_model();
        model.ordering = vec![0, 0];
        let encoded = model.to_toml_string().expect("encode");
        assert!(matches!(
            EbmModel::from_toml_str(&encoded),
            Err(ArtifactError::Inconsistent(_))
        ));
    }

    #[test]
    fn save_and_load_through_file() {
        let model = small_model();
        let path = std::env::temp_dir().join(format!(
            "event_based_models_artifact_{}.toml",
            std::process::id()
        ));
        model.save(&path).expect("save");
        let loaded = EbmModel::load(&path).expect("load");
        let _ = fs::remove_file(&path);
        assert_eq!(loaded.ordering, model.ordering);
        assert_eq!(loaded.biomarker_names, vec!["first", "second"]);
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            EbmModel::load("/nonexistent/event_based_models/model.toml"),
            Err(ArtifactError::Io(_))
        ));
    }
}
