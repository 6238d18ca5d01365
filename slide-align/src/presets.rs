//! Transform persistence
//!
//! Two kinds of saved transforms:
//!
//! - **Presets** - named, reusable per microscope and slide mounting method.
//!   All presets for a configuration directory live in one
//!   `saved_transforms.json`, keyed by name.
//! - **Slide alignments** - the transform found for one sample, stored in the
//!   project as `alignmentFiles/<sample>_alignment.json`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stage_math::AffineTransform2D;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StageBounds;
use crate::green_box::GreenBoxParams;

/// File holding all presets in a configuration directory
pub const TRANSFORMS_FILE: &str = "saved_transforms.json";

/// Project subdirectory holding per-sample alignments
pub const ALIGNMENT_DIR: &str = "alignmentFiles";

/// Error during transform persistence or validation
#[derive(Error, Debug)]
pub enum PresetError {
    /// IO error during save/load
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transform maps part of the image outside the stage travel
    #[error(
        "image point ({image_x:.1}, {image_y:.1}) maps to stage ({stage_x:.1}, {stage_y:.1}), \
         outside stage bounds"
    )]
    OutOfBounds {
        image_x: f64,
        image_y: f64,
        stage_x: f64,
        stage_y: f64,
    },
}

/// Named transform with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformPreset {
    pub name: String,
    pub microscope: String,
    pub mounting_method: String,
    pub transform: AffineTransform2D,
    #[serde(rename = "createdDate")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub notes: String,
    /// Detection settings that worked for this mounting method
    #[serde(default)]
    pub green_box_params: Option<GreenBoxParams>,
}

impl TransformPreset {
    pub fn new(
        name: impl Into<String>,
        microscope: impl Into<String>,
        mounting_method: impl Into<String>,
        transform: AffineTransform2D,
    ) -> Self {
        Self {
            name: name.into(),
            microscope: microscope.into(),
            mounting_method: mounting_method.into(),
            transform,
            created: Utc::now(),
            notes: String::new(),
            green_box_params: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_green_box_params(mut self, params: GreenBoxParams) -> Self {
        self.green_box_params = Some(params);
        self
    }
}

/// Presets stored in one configuration directory
///
/// Every change is written to disk immediately.
#[derive(Debug)]
pub struct TransformPresetStore {
    path: PathBuf,
    presets: BTreeMap<String, TransformPreset>,
}

impl TransformPresetStore {
    /// Load `saved_transforms.json` from `config_dir`; a missing file is an empty store
    pub fn open(config_dir: impl AsRef<Path>) -> Result<Self, PresetError> {
        let path = config_dir.as_ref().join(TRANSFORMS_FILE);

        let mut presets: BTreeMap<String, TransformPreset> = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            info!("No saved transforms file found at {}", path.display());
            BTreeMap::new()
        };

        // Older files predate green box settings
        for (name, preset) in presets.iter_mut() {
            if preset.green_box_params.is_none() {
                debug!("Adding default green box params to legacy preset '{name}'");
                preset.green_box_params = Some(GreenBoxParams::default());
            }
        }

        info!("Loaded {} transform presets from {}", presets.len(), path.display());
        Ok(Self { path, presets })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), PresetError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(writer, &self.presets)?;
        debug!(
            "Persisted {} transforms to {}",
            self.presets.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Add or replace a preset by name
    pub fn save_preset(&mut self, preset: TransformPreset) -> Result<(), PresetError> {
        let name = preset.name.clone();
        self.presets.insert(name.clone(), preset);
        self.persist()?;
        info!("Saved transform preset: {name}");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TransformPreset> {
        self.presets.get(name)
    }

    /// Presets for one microscope, ordered by name
    pub fn for_microscope(&self, microscope: &str) -> Vec<&TransformPreset> {
        self.presets
            .values()
            .filter(|p| p.microscope == microscope)
            .collect()
    }

    /// All presets, ordered by name
    pub fn all(&self) -> impl Iterator<Item = &TransformPreset> {
        self.presets.values()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Remove a preset; returns whether it existed
    pub fn delete(&mut self, name: &str) -> Result<bool, PresetError> {
        if self.presets.remove(name).is_none() {
            return Ok(false);
        }
        self.persist()?;
        info!("Deleted transform preset: {name}");
        Ok(true)
    }
}

/// Per-sample alignment file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlideAlignment {
    pub sample_name: String,
    pub modality: String,
    pub timestamp: DateTime<Utc>,
    /// `[m00, m10, m01, m11, m02, m12]`
    pub transform: [f64; 6],
}

fn slide_alignment_path(project_dir: &Path, sample_name: &str) -> PathBuf {
    project_dir
        .join(ALIGNMENT_DIR)
        .join(format!("{sample_name}_alignment.json"))
}

/// Store the transform found for one sample; returns the written file
pub fn save_slide_alignment(
    project_dir: impl AsRef<Path>,
    sample_name: &str,
    modality: &str,
    transform: &AffineTransform2D,
) -> Result<PathBuf, PresetError> {
    let path = slide_alignment_path(project_dir.as_ref(), sample_name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let alignment = SlideAlignment {
        sample_name: sample_name.to_string(),
        modality: modality.to_string(),
        timestamp: Utc::now(),
        transform: transform.coefficients(),
    };
    let writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(writer, &alignment)?;

    info!("Saved slide-specific alignment to: {}", path.display());
    Ok(path)
}

/// Transform saved for `sample_name`, or `None` if the sample has none
pub fn load_slide_alignment(
    project_dir: impl AsRef<Path>,
    sample_name: &str,
) -> Result<Option<AffineTransform2D>, PresetError> {
    let path = slide_alignment_path(project_dir.as_ref(), sample_name);
    if !path.exists() {
        info!("No slide-specific alignment found at: {}", path.display());
        return Ok(None);
    }

    let reader = BufReader::new(File::open(&path)?);
    let alignment: SlideAlignment = serde_json::from_reader(reader)?;
    info!(
        "Loaded slide alignment for '{}' ({}) saved {}",
        alignment.sample_name, alignment.modality, alignment.timestamp
    );
    Ok(Some(AffineTransform2D::from_coefficients(alignment.transform)))
}

/// Check that the image corners and center land inside the stage travel
pub fn validate_transform(
    transform: &AffineTransform2D,
    image_width: f64,
    image_height: f64,
    bounds: &StageBounds,
) -> Result<(), PresetError> {
    let test_points = [
        (0.0, 0.0),
        (image_width, 0.0),
        (0.0, image_height),
        (image_width, image_height),
        (image_width / 2.0, image_height / 2.0),
    ];

    for (image_x, image_y) in test_points {
        let (stage_x, stage_y) = transform.transform_point(image_x, image_y);
        if !bounds.contains(stage_x, stage_y) {
            warn!(
                "Transform validation failed: ({image_x}, {image_y}) -> \
                 ({stage_x:.1}, {stage_y:.1})"
            );
            return Err(PresetError::OutOfBounds {
                image_x,
                image_y,
                stage_x,
                stage_y,
            });
        }
    }

    info!("Transform validation passed for all test points");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn sample_transform() -> AffineTransform2D {
        AffineTransform2D::from_coefficients([0.25, 0.0, 0.0, -0.25, 1000.0, 2000.0])
    }

    #[test]
    fn test_store_roundtrip_through_disk() {
        let dir = tempdir().unwrap();

        let mut store = TransformPresetStore::open(dir.path()).unwrap();
        assert!(store.is_empty());

        store
            .save_preset(
                TransformPreset::new("slide-a", "scope1", "standard", sample_transform())
                    .with_notes("first")
                    .with_green_box_params(GreenBoxParams::default()),
            )
            .unwrap();
        store
            .save_preset(TransformPreset::new("b", "scope2", "inverted", sample_transform()))
            .unwrap();
        store
            .save_preset(TransformPreset::new("a", "scope1", "inverted", sample_transform()))
            .unwrap();

        let reopened = TransformPresetStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 3);

        let preset = reopened.get("slide-a").unwrap();
        assert_eq!(preset.notes, "first");
        assert_eq!(preset.transform, sample_transform());

        let names: Vec<_> = reopened
            .for_microscope("scope1")
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "slide-a"]);
    }

    #[test]
    fn test_delete_persists() {
        let dir = tempdir().unwrap();
        let mut store = TransformPresetStore::open(dir.path()).unwrap();
        store
            .save_preset(TransformPreset::new("x", "scope", "m", sample_transform()))
            .unwrap();

        assert!(store.delete("x").unwrap());
        assert!(!store.delete("x").unwrap());
        assert!(TransformPresetStore::open(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_legacy_preset_gets_default_green_box_params() {
        let dir = tempdir().unwrap();
        let legacy = r#"{
            "old": {
                "name": "old",
                "microscope": "scope",
                "mountingMethod": "standard",
                "transform": {"m00": 1.0, "m10": 0.0, "m01": 0.0, "m11": 1.0, "m02": 5.0, "m12": 6.0},
                "createdDate": "2024-03-01T12:00:00Z"
            }
        }"#;
        fs::write(dir.path().join(TRANSFORMS_FILE), legacy).unwrap();

        let store = TransformPresetStore::open(dir.path()).unwrap();
        let preset = store.get("old").unwrap();
        assert_eq!(preset.green_box_params, Some(GreenBoxParams::default()));
        assert_eq!(preset.transform.transform_point(0.0, 0.0), (5.0, 6.0));
    }

    #[test]
    fn test_slide_alignment_roundtrip() {
        let dir = tempdir().unwrap();

        assert!(load_slide_alignment(dir.path(), "S1").unwrap().is_none());

        let path =
            save_slide_alignment(dir.path(), "S1", "brightfield", &sample_transform()).unwrap();
        assert!(path.ends_with("alignmentFiles/S1_alignment.json"));

        let loaded = load_slide_alignment(dir.path(), "S1").unwrap().unwrap();
        assert_eq!(loaded.coefficients(), sample_transform().coefficients());

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(raw["sampleName"], "S1");
        assert_eq!(raw["transform"][4], 1000.0);
    }

    #[test]
    fn test_validate_transform() {
        let t = sample_transform();
        let bounds = StageBounds::new(0.0, 5000.0, -1000.0, 3000.0);

        // 4000x8000 image spans x 1000..2000, y 0..2000
        assert!(validate_transform(&t, 4000.0, 8000.0, &bounds).is_ok());

        // 20000 px wide reaches x = 6000
        let err = validate_transform(&t, 20000.0, 100.0, &bounds).unwrap_err();
        match err {
            PresetError::OutOfBounds { image_x, stage_x, .. } => {
                assert_eq!(image_x, 20000.0);
                assert_relative_eq!(stage_x, 6000.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
