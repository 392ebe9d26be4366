//! Versioned serialisation of trained models.
//!
//! An artefact is a leading version string followed by that version's
//! payload, bincode-encoded and transparently gzip-compressed when the file
//! name ends in `.gz`. The current version is `"4"`; the historical
//! versions `0`, `1`, `2`, `3.0`, `3.1`, `DSTC13` and `DSTC13.2` are
//! recognised on load and upgraded in-memory. The `features_list` field
//! written by version 0–2 (and `DSTC13`) savers is read and discarded, and
//! their single scalar decision threshold is dropped in favour of the
//! per-classifier default.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assembler::{Abstraction, FeatureType};
use crate::classifier::ClassifierType;
use crate::da::DialogueActItem;
use crate::error::{SluError, SluResult};
use crate::features::Feature;
use crate::logistic::LogisticParams;
use crate::sparse::SparseVec;
use crate::tree::DecisionTree;

pub const CURRENT_VERSION: &str = "4";

/// The classifier parameters of a version-4 artefact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClassifierPayload {
    Logistic {
        intercepts: BTreeMap<DialogueActItem, f64>,
        coefs: BTreeMap<DialogueActItem, SparseVec>,
    },
    Tree {
        trees: BTreeMap<DialogueActItem, DecisionTree>,
    },
}

/// The version-4 model payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredModel {
    pub feature_idxs: Vec<(Feature, usize)>,
    pub clser_type: ClassifierType,
    pub payload: ClassifierPayload,
    pub features_type: BTreeSet<FeatureType>,
    pub features_size: usize,
    pub cls_thresholds: BTreeMap<DialogueActItem, f64>,
    pub abstractions: BTreeSet<Abstraction>,
}

/// A classifier as stored by pre-4 savers, parameters inline per DAI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LegacyClassifier {
    Logistic(LogisticParams),
    Tree(DecisionTree),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelV0 {
    pub features_list: Vec<Feature>,
    pub feature_idxs: Vec<(Feature, usize)>,
    pub classifiers: BTreeMap<DialogueActItem, LegacyClassifier>,
    pub features_type: BTreeSet<FeatureType>,
    pub features_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelV1 {
    pub features_list: Vec<Feature>,
    pub feature_idxs: Vec<(Feature, usize)>,
    pub classifiers: BTreeMap<DialogueActItem, LegacyClassifier>,
    pub features_type: BTreeSet<FeatureType>,
    pub features_size: usize,
    pub cls_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelV2 {
    pub features_list: Vec<Feature>,
    pub feature_idxs: Vec<(Feature, usize)>,
    pub clser_type: ClassifierType,
    pub classifiers: BTreeMap<DialogueActItem, LegacyClassifier>,
    pub features_type: BTreeSet<FeatureType>,
    pub features_size: usize,
    pub cls_threshold: f64,
}

/// Versions `3.0` and `DSTC13.2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelV3 {
    pub feature_idxs: Vec<(Feature, usize)>,
    pub clser_type: ClassifierType,
    pub classifiers: BTreeMap<DialogueActItem, LegacyClassifier>,
    pub features_type: BTreeSet<FeatureType>,
    pub features_size: usize,
    pub cls_threshold: f64,
    pub abstractions: BTreeSet<Abstraction>,
}

/// Version `3.1`: the threshold became a per-classifier map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelV31 {
    pub feature_idxs: Vec<(Feature, usize)>,
    pub clser_type: ClassifierType,
    pub classifiers: BTreeMap<DialogueActItem, LegacyClassifier>,
    pub features_type: BTreeSet<FeatureType>,
    pub features_size: usize,
    pub cls_thresholds: BTreeMap<DialogueActItem, f64>,
    pub abstractions: BTreeSet<Abstraction>,
}

/// Version `DSTC13`: as `3.0` with the leading feature list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelV3Dstc {
    pub features_list: Vec<Feature>,
    pub feature_idxs: Vec<(Feature, usize)>,
    pub clser_type: ClassifierType,
    pub classifiers: BTreeMap<DialogueActItem, LegacyClassifier>,
    pub features_type: BTreeSet<FeatureType>,
    pub features_size: usize,
    pub cls_threshold: f64,
    pub abstractions: BTreeSet<Abstraction>,
}

fn default_abstractions() -> BTreeSet<Abstraction> {
    [Abstraction::Concrete, Abstraction::Abstract]
        .into_iter()
        .collect()
}

/// Recast per-DAI legacy classifiers as the version-4 payload.
fn upgrade_classifiers(
    clser_type: ClassifierType,
    classifiers: BTreeMap<DialogueActItem, LegacyClassifier>,
) -> SluResult<ClassifierPayload> {
    match clser_type {
        ClassifierType::Logistic => {
            let mut intercepts = BTreeMap::new();
            let mut coefs = BTreeMap::new();
            for (dai, clser) in classifiers {
                let LegacyClassifier::Logistic(params) = clser else {
                    return Err(SluError::Serde(format!(
                        "logistic model stores a tree classifier for {dai}"
                    )));
                };
                intercepts.insert(dai.clone(), params.intercept);
                coefs.insert(dai, params.coefs);
            }
            Ok(ClassifierPayload::Logistic { intercepts, coefs })
        }
        ClassifierType::Tree => {
            let mut trees = BTreeMap::new();
            for (dai, clser) in classifiers {
                let LegacyClassifier::Tree(tree) = clser else {
                    return Err(SluError::Serde(format!(
                        "tree model stores a logistic classifier for {dai}"
                    )));
                };
                trees.insert(dai, tree);
            }
            Ok(ClassifierPayload::Tree { trees })
        }
    }
}

impl StoredModel {
    fn from_v0(model: ModelV0) -> SluResult<Self> {
        let ModelV0 {
            features_list: _,
            feature_idxs,
            classifiers,
            features_type,
            features_size,
        } = model;
        Ok(Self {
            feature_idxs,
            clser_type: ClassifierType::Logistic,
            payload: upgrade_classifiers(ClassifierType::Logistic, classifiers)?,
            features_type,
            features_size,
            cls_thresholds: BTreeMap::new(),
            abstractions: default_abstractions(),
        })
    }

    fn from_v1(model: ModelV1) -> SluResult<Self> {
        let ModelV1 {
            features_list: _,
            feature_idxs,
            classifiers,
            features_type,
            features_size,
            cls_threshold: _,
        } = model;
        Ok(Self {
            feature_idxs,
            clser_type: ClassifierType::Logistic,
            payload: upgrade_classifiers(ClassifierType::Logistic, classifiers)?,
            features_type,
            features_size,
            cls_thresholds: BTreeMap::new(),
            abstractions: default_abstractions(),
        })
    }

    fn from_v2(model: ModelV2) -> SluResult<Self> {
        let ModelV2 {
            features_list: _,
            feature_idxs,
            clser_type,
            classifiers,
            features_type,
            features_size,
            cls_threshold: _,
        } = model;
        Ok(Self {
            feature_idxs,
            clser_type,
            payload: upgrade_classifiers(clser_type, classifiers)?,
            features_type,
            features_size,
            cls_thresholds: BTreeMap::new(),
            abstractions: default_abstractions(),
        })
    }

    fn from_v3(model: ModelV3) -> SluResult<Self> {
        let ModelV3 {
            feature_idxs,
            clser_type,
            classifiers,
            features_type,
            features_size,
            cls_threshold: _,
            abstractions,
        } = model;
        Ok(Self {
            feature_idxs,
            clser_type,
            payload: upgrade_classifiers(clser_type, classifiers)?,
            features_type,
            features_size,
            cls_thresholds: BTreeMap::new(),
            abstractions,
        })
    }

    fn from_v31(model: ModelV31) -> SluResult<Self> {
        let ModelV31 {
            feature_idxs,
            clser_type,
            classifiers,
            features_type,
            features_size,
            cls_thresholds,
            abstractions,
        } = model;
        Ok(Self {
            feature_idxs,
            clser_type,
            payload: upgrade_classifiers(clser_type, classifiers)?,
            features_type,
            features_size,
            cls_thresholds,
            abstractions,
        })
    }

    fn from_v3_dstc(model: ModelV3Dstc) -> SluResult<Self> {
        let ModelV3Dstc {
            features_list: _,
            feature_idxs,
            clser_type,
            classifiers,
            features_type,
            features_size,
            cls_threshold: _,
            abstractions,
        } = model;
        Ok(Self {
            feature_idxs,
            clser_type,
            payload: upgrade_classifiers(clser_type, classifiers)?,
            features_type,
            features_size,
            cls_thresholds: BTreeMap::new(),
            abstractions,
        })
    }

    /// Write the model, version `"4"`. Compression follows the `.gz`
    /// suffix unless forced with `gzip`.
    pub fn save(&self, path: impl AsRef<Path>, gzip: Option<bool>) -> SluResult<()> {
        let path = path.as_ref();
        let gz = gzip.unwrap_or_else(|| is_gz_path(path));
        save_versioned(path, gz, CURRENT_VERSION, self)?;
        info!(path = %path.display(), gz, "saved model");
        Ok(())
    }

    /// Read a model artefact of any supported version, upgrading legacy
    /// versions in-memory. Unknown versions are a fatal error.
    pub fn load(path: impl AsRef<Path>) -> SluResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut reader: Box<dyn Read> = if is_gz_path(path) {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let version: String = deserialize_part(&mut reader)?;
        let model = match version.as_str() {
            "4" => deserialize_part(&mut reader)?,
            "0" => Self::from_v0(deserialize_part(&mut reader)?)?,
            "1" => Self::from_v1(deserialize_part(&mut reader)?)?,
            "2" => Self::from_v2(deserialize_part(&mut reader)?)?,
            "3.0" | "DSTC13.2" => Self::from_v3(deserialize_part(&mut reader)?)?,
            "3.1" => Self::from_v31(deserialize_part(&mut reader)?)?,
            "DSTC13" => Self::from_v3_dstc(deserialize_part(&mut reader)?)?,
            unknown => return Err(SluError::ModelVersion(unknown.to_string())),
        };
        info!(path = %path.display(), version, "loaded model");
        Ok(model)
    }
}

fn is_gz_path(path: &Path) -> bool {
    path.to_string_lossy().ends_with("gz")
}

fn deserialize_part<T: DeserializeOwned>(reader: &mut impl Read) -> SluResult<T> {
    bincode::deserialize_from(reader).map_err(|err| SluError::Serde(err.to_string()))
}

/// Write a version tag followed by its payload. Public to the crate so
/// tests can author legacy artefacts.
pub(crate) fn save_versioned<T: Serialize>(
    path: &Path,
    gz: bool,
    version: &str,
    payload: &T,
) -> SluResult<()> {
    let file = File::create(path)?;
    if gz {
        let mut writer = GzEncoder::new(BufWriter::new(file), Compression::default());
        serialize_part(&mut writer, &version.to_string())?;
        serialize_part(&mut writer, payload)?;
        writer
            .finish()
            .map_err(SluError::Io)?
            .flush()
            .map_err(SluError::Io)?;
    } else {
        let mut writer = BufWriter::new(file);
        serialize_part(&mut writer, &version.to_string())?;
        serialize_part(&mut writer, payload)?;
        writer.flush()?;
    }
    Ok(())
}

fn serialize_part<T: Serialize>(writer: &mut impl Write, value: &T) -> SluResult<()> {
    bincode::serialize_into(writer, value).map_err(|err| SluError::Serde(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureTag;

    fn sample_feature(word: &str) -> Feature {
        Feature {
            set_idx: 0,
            tag: FeatureTag::Ngram(vec![word.to_string()]),
        }
    }

    fn sample_logistic() -> (DialogueActItem, LegacyClassifier) {
        (
            DialogueActItem::new("hello"),
            LegacyClassifier::Logistic(LogisticParams {
                intercept: -0.5,
                coefs: SparseVec::from_pairs(vec![(0, 1.25)]),
            }),
        )
    }

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "libslu_model_{}_{}",
            std::process::id(),
            name
        ));
        path
    }

    #[test]
    fn v4_roundtrip_plain_and_gzipped() {
        let (dai, clser) = sample_logistic();
        let LegacyClassifier::Logistic(params) = clser else {
            unreachable!()
        };
        let stored = StoredModel {
            feature_idxs: vec![(sample_feature("hello"), 0)],
            clser_type: ClassifierType::Logistic,
            payload: ClassifierPayload::Logistic {
                intercepts: [(dai.clone(), params.intercept)].into_iter().collect(),
                coefs: [(dai.clone(), params.coefs.clone())].into_iter().collect(),
            },
            features_type: [FeatureType::Ngram].into_iter().collect(),
            features_size: 4,
            cls_thresholds: [(dai.clone(), 0.4)].into_iter().collect(),
            abstractions: default_abstractions(),
        };

        for name in ["plain.slu", "packed.slu.gz"] {
            let path = tmp_path(name);
            stored.save(&path, None).expect("save");
            let loaded = StoredModel::load(&path).expect("load");
            assert_eq!(loaded.feature_idxs, stored.feature_idxs);
            assert_eq!(loaded.payload, stored.payload);
            assert_eq!(loaded.cls_thresholds, stored.cls_thresholds);
            assert_eq!(loaded.abstractions, stored.abstractions);
            std::fs::remove_file(&path).ok();
        }
    }

    #[test]
    fn legacy_v2_loads_and_drops_features_list() {
        let (dai, clser) = sample_logistic();
        let legacy = ModelV2 {
            features_list: vec![sample_feature("dead")],
            feature_idxs: vec![(sample_feature("hello"), 0)],
            clser_type: ClassifierType::Logistic,
            classifiers: [(dai.clone(), clser)].into_iter().collect(),
            features_type: [FeatureType::Ngram].into_iter().collect(),
            features_size: 4,
            cls_threshold: 0.5,
        };
        let path = tmp_path("legacy_v2.slu");
        save_versioned(&path, false, "2", &legacy).expect("save");

        let loaded = StoredModel::load(&path).expect("load");
        assert_eq!(loaded.clser_type, ClassifierType::Logistic);
        let ClassifierPayload::Logistic { intercepts, coefs } = &loaded.payload else {
            panic!("expected logistic payload");
        };
        assert_eq!(intercepts.get(&dai), Some(&-0.5));
        assert_eq!(coefs.get(&dai).unwrap().nnz(), 1);
        // Legacy scalar thresholds are dropped; decoding falls back to the
        // per-classifier default.
        assert!(loaded.cls_thresholds.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn legacy_v31_keeps_threshold_map() {
        let (dai, clser) = sample_logistic();
        let legacy = ModelV31 {
            feature_idxs: vec![(sample_feature("hello"), 0)],
            clser_type: ClassifierType::Logistic,
            classifiers: [(dai.clone(), clser)].into_iter().collect(),
            features_type: [FeatureType::Ngram].into_iter().collect(),
            features_size: 4,
            cls_thresholds: [(dai.clone(), 0.35)].into_iter().collect(),
            abstractions: default_abstractions(),
        };
        let path = tmp_path("legacy_v31.slu");
        save_versioned(&path, false, "3.1", &legacy).expect("save");
        let loaded = StoredModel::load(&path).expect("load");
        assert_eq!(loaded.cls_thresholds.get(&dai), Some(&0.35));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn unknown_version_is_fatal() {
        let path = tmp_path("unknown.slu");
        save_versioned(&path, false, "99", &Vec::<u8>::new()).expect("save");
        let err = StoredModel::load(&path);
        assert!(matches!(err, Err(SluError::ModelVersion(v)) if v == "99"));
        std::fs::remove_file(&path).ok();
    }
}
