//! libslu-core
//!
//! Spoken language understanding core: maps a user utterance (or a lattice
//! of utterance hypotheses) to a confusion network of dialogue-act items.
//! One binary classifier is trained per dialogue-act item; decoding
//! evaluates every trained classifier and assembles the per-item
//! probabilities into a confusion network.
//!
//! Public API:
//! - `DaiClassifier` - training and decoding engine
//! - `DialogueAct` / `DialogueActItem` / `DaiConfusionNetwork` - dialogue acts
//! - `Utterance` / `UtteranceConfnet` / `AbstractedUtterance` - inputs
//! - `Preprocessor` - text normalisation and value abstraction seam
//! - `Config` - configuration and training knobs
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{SluError, SluResult};

pub mod da;
pub use da::{
    merge_slu_confnets, CombineMethod, DaiConfusionNetwork, DaiCounts, DialogueAct,
    DialogueActItem,
};

pub mod utterance;
pub use utterance::{
    AbstractedConfnet, AbstractedHyp, AbstractedToken, AbstractedUtterance, CategoryLabelMap,
    DaNbList, HypKind, InputHyp, Preprocessor, SlotInstantiation, Utterance, UtteranceConfnet,
    UtteranceNbList,
};

pub mod features;
pub use features::{Feature, FeatureSet, FeatureTag, JointFeatures};

pub mod registry;
pub use registry::FeatureRegistry;

pub mod catalogue;
pub use catalogue::DaiCatalogue;

pub mod sparse;
pub use sparse::{crop_to_finite, CsrMatrix, SparseVec};

pub mod assembler;
pub use assembler::{Abstraction, AssemblyInput, FeatureAssembler, FeatureType, Instantiation};

pub mod logistic;
pub use logistic::{sigmoid, LogisticParams};

pub mod tree;
pub use tree::DecisionTree;

pub mod calibrate;
pub use calibrate::calibrate_threshold;

pub mod classifier;
pub use classifier::{
    ClassifierType, DaiClassifier, ParseInput, SkipReason, TrainOpts, TrainReport, TrainingData,
};

pub mod model;
pub use model::StoredModel;

/// Configuration of the SLU core.
///
/// Covers the feature space (types, n-gram order, abstraction views), the
/// classifier flavour, pruning thresholds and training hyper-parameters.
/// Decoding options that vary per call (`prob_combine_meth`) carry their
/// defaults here as well.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Classifier flavour: logistic regression or a shallow decision tree.
    pub clser_type: ClassifierType,

    /// Feature types to extract, mix-and-matchable.
    pub features_type: BTreeSet<FeatureType>,
    /// Maximum n-gram order.
    pub features_size: usize,
    /// Which views of the utterance contribute features.
    pub abstractions: BTreeSet<Abstraction>,

    /// Minimum occurrences for a feature to survive global pruning.
    pub min_feature_count: usize,
    /// Ditto for features of the concrete (non-abstracted) view.
    pub min_conc_feature_count: usize,
    /// Minimum occurrences of a concrete slot-value DAI for it to keep its
    /// own classifier.
    pub min_dai_count: usize,

    /// Inverse regularisation strength of the logistic learner.
    pub sparsification: f64,
    /// Resample training rows until the classes are balanced.
    pub balance: bool,
    /// Calibrate per-classifier decision thresholds after fitting.
    pub calibrate: bool,

    /// Seed of the balancing PRNG, so training runs are reproducible.
    pub seed: u64,

    /// How probabilities for the same DAI from different classifiers are
    /// merged during decoding.
    pub prob_combine_meth: CombineMethod,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clser_type: ClassifierType::Logistic,
            features_type: [FeatureType::Ngram].into_iter().collect(),
            // N-grams up to order 4, as the upstream extractors produce.
            features_size: 4,
            abstractions: [Abstraction::Concrete, Abstraction::Abstract]
                .into_iter()
                .collect(),
            min_feature_count: 5,
            min_conc_feature_count: 4,
            min_dai_count: 5,
            sparsification: 1.0,
            balance: true,
            calibrate: true,
            seed: 42,
            prob_combine_meth: CombineMethod::Max,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_toml_roundtrip() {
        let mut config = Config::default();
        config.features_size = 3;
        config.seed = 7;
        let rendered = config.to_toml_string().expect("serialize");
        let back = Config::from_toml_str(&rendered).expect("parse");
        assert_eq!(back.features_size, 3);
        assert_eq!(back.seed, 7);
        assert_eq!(back.clser_type, ClassifierType::Logistic);
        assert!(back.abstractions.contains(&Abstraction::Abstract));
    }
}
