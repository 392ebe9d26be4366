//! The dialogue-act item classifier: training and decoding.
//!
//! One binary classifier is trained per dialogue-act item surviving the
//! catalogue pruning. Generic items (category-label values) are trained and
//! decoded over the slot-value instantiations found in the abstracted
//! input; concrete items fall back to the concrete feature vector. Decoding
//! evaluates every trained classifier and merges the per-item probabilities
//! into a confusion network.
//!
//! Training iterates items in sorted order and failures are local: an item
//! with too little data or a failed fit is skipped with a logged reason and
//! the loop continues.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assembler::{AssemblyInput, FeatureAssembler, Instantiation};
use crate::calibrate::{calibrate_threshold, DEFAULT_THRESHOLD};
use crate::catalogue::DaiCatalogue;
use crate::da::{
    merge_slu_confnets, CombineMethod, DaiConfusionNetwork, DaiCounts, DialogueAct,
    DialogueActItem,
};
use crate::error::{SluError, SluResult};
use crate::features::JointFeatures;
use crate::logistic::{fit_logistic, sigmoid, LogisticOptions, LogisticParams};
use crate::model::{ClassifierPayload, StoredModel};
use crate::registry::FeatureRegistry;
use crate::sparse::CsrMatrix;
use crate::tree::{DecisionTree, TreeOptions};
use crate::utterance::{
    AbstractedHyp, CategoryLabelMap, DaNbList, InputHyp, Preprocessor, SlotInstantiation,
    Utterance, UtteranceConfnet, UtteranceNbList,
};
use crate::Config;

/// Hypotheses below this probability are dropped from n-best parse output.
const PRUNE_PROB: f64 = 0.001;

/// Which learner backs the per-DAI classifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierType {
    #[default]
    Logistic,
    Tree,
}

/// Training inputs, keyed by utterance id. The maps are expected to share
/// one key set; `das` is obligatory.
#[derive(Debug, Clone, Default)]
pub struct TrainingData {
    pub utterances: Option<BTreeMap<String, Utterance>>,
    pub das: BTreeMap<String, DialogueAct>,
    pub prev_das: Option<BTreeMap<String, DialogueAct>>,
    pub utt_nblists: Option<BTreeMap<String, UtteranceNbList>>,
    pub da_nblists: Option<BTreeMap<String, DaNbList>>,
    pub da_nblists_orig: Option<BTreeMap<String, DaNbList>>,
}

/// Knobs of one training run.
#[derive(Debug, Clone)]
pub struct TrainOpts {
    /// Inverse regularisation strength of the logistic learner.
    pub sparsification: f64,
    /// Per-DAI adaptive feature-pruning threshold; falls back to the value
    /// remembered from `prune_features`.
    pub min_feature_count: Option<usize>,
    pub min_correct_dai_count: Option<usize>,
    pub min_incorrect_dai_count: Option<usize>,
    pub balance: bool,
    pub calibrate: bool,
}

impl Default for TrainOpts {
    fn default() -> Self {
        Self {
            sparsification: 1.0,
            min_feature_count: None,
            min_correct_dai_count: None,
            min_incorrect_dai_count: None,
            balance: true,
            calibrate: true,
        }
    }
}

/// Why a DAI was skipped during training.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NotEnoughPositive { n_pos: usize, required: usize },
    NotEnoughNegative { n_neg: usize, required: usize },
    NoFeatures,
    Fit(String),
}

/// The outcome of one `train` call: fitted classifiers and collated skips.
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    pub fitted: Vec<DialogueActItem>,
    pub skipped: Vec<(DialogueActItem, SkipReason)>,
}

/// Decoding inputs for a single hypothesis.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseInput<'a> {
    pub utterance: Option<&'a Utterance>,
    pub prev_da: Option<&'a DialogueAct>,
    pub utt_nblist: Option<&'a UtteranceNbList>,
    pub da_nblist: Option<&'a DaNbList>,
    pub da_nblist_orig: Option<&'a DaNbList>,
}

pub struct DaiClassifier {
    preprocessing: Option<Box<dyn Preprocessor>>,
    clser_type: ClassifierType,
    assembler: FeatureAssembler,
    registry: FeatureRegistry,
    catalogue: DaiCatalogue,
    rng: StdRng,

    utt_ids: Vec<String>,
    utterances: Option<BTreeMap<String, InputHyp>>,
    abutterances: Option<BTreeMap<String, AbstractedHyp>>,
    das: BTreeMap<String, DialogueAct>,
    prev_das: Option<BTreeMap<String, DialogueAct>>,
    utt_nblists: Option<BTreeMap<String, UtteranceNbList>>,
    da_nblists: Option<BTreeMap<String, DaNbList>>,
    da_nblists_orig: Option<BTreeMap<String, DaNbList>>,
    category_labels: BTreeMap<String, CategoryLabelMap>,
    /// Per-utterance feature cache, dropped after `prune_features`.
    utterance_features: Option<BTreeMap<String, JointFeatures>>,

    logistic_models: BTreeMap<DialogueActItem, LogisticParams>,
    tree_models: BTreeMap<DialogueActItem, DecisionTree>,
    cls_thresholds: BTreeMap<DialogueActItem, f64>,

    default_min_feat_count: usize,
    default_min_correct_dai_count: usize,
    default_min_incorrect_dai_count: usize,
}

impl DaiClassifier {
    pub fn new(config: &Config, preprocessing: Option<Box<dyn Preprocessor>>) -> Self {
        let assembler = FeatureAssembler::new(
            config.features_type.clone(),
            config.features_size,
            config.abstractions.clone(),
        );
        Self {
            preprocessing,
            clser_type: config.clser_type,
            assembler,
            registry: FeatureRegistry::new(),
            catalogue: DaiCatalogue::new(),
            rng: StdRng::seed_from_u64(config.seed),
            utt_ids: Vec::new(),
            utterances: None,
            abutterances: None,
            das: BTreeMap::new(),
            prev_das: None,
            utt_nblists: None,
            da_nblists: None,
            da_nblists_orig: None,
            category_labels: BTreeMap::new(),
            utterance_features: None,
            logistic_models: BTreeMap::new(),
            tree_models: BTreeMap::new(),
            cls_thresholds: BTreeMap::new(),
            default_min_feat_count: 1,
            default_min_correct_dai_count: 1,
            default_min_incorrect_dai_count: 1,
        }
    }

    pub fn clser_type(&self) -> ClassifierType {
        self.clser_type
    }

    /// Number of features in use.
    pub fn n_features(&self) -> usize {
        self.registry.len()
    }

    pub fn dai_counts(&self) -> &DaiCounts {
        self.catalogue.counts()
    }

    /// DAIs with a trained classifier, in sorted order.
    pub fn trained_dais(&self) -> Vec<&DialogueActItem> {
        match self.clser_type {
            ClassifierType::Logistic => self.logistic_models.keys().collect(),
            ClassifierType::Tree => self.tree_models.keys().collect(),
        }
    }

    /// Decision threshold of a classifier (0.5 when never calibrated).
    pub fn threshold(&self, dai: &DialogueActItem) -> f64 {
        self.cls_thresholds
            .get(dai)
            .copied()
            .unwrap_or(DEFAULT_THRESHOLD)
    }

    // ========== Feature extraction ==========

    /// Extracts features from the training inputs, making use of their
    /// corresponding DAs. This is a pre-requisite to pruning features,
    /// pruning classifiers and training.
    pub fn extract_features(&mut self, data: TrainingData) -> SluResult<()> {
        let TrainingData {
            utterances,
            das,
            prev_das,
            utt_nblists,
            da_nblists,
            da_nblists_orig,
        } = data;

        self.utt_ids = if let Some(utts) = &utterances {
            utts.keys().cloned().collect()
        } else if let Some(nbls) = &utt_nblists {
            nbls.keys().cloned().collect()
        } else if let Some(nbls) = &da_nblists {
            nbls.keys().cloned().collect()
        } else if let Some(nbls) = &da_nblists_orig {
            nbls.keys().cloned().collect()
        } else {
            return Err(SluError::Configuration(
                "cannot learn a classifier without utterances and without ASR or SLU hypotheses"
                    .into(),
            ));
        };

        self.das = das;
        self.prev_das = prev_das;
        self.da_nblists = da_nblists;
        self.da_nblists_orig = da_nblists_orig;
        self.category_labels.clear();
        self.abutterances = None;

        let mut utterances = utterances;
        let mut utt_nblists = utt_nblists;

        if let Some(pre) = &self.preprocessing {
            if utterances.is_none() && utt_nblists.is_none() {
                return Err(SluError::Configuration(
                    "cannot do preprocessing without utterances and without ASR hypotheses".into(),
                ));
            }
            // Learning from transcriptions...
            if let Some(utts) = &mut utterances {
                let mut abutts = BTreeMap::new();
                for id in &self.utt_ids {
                    let da = self.das.get(id).ok_or_else(|| {
                        SluError::Configuration(format!("no DA for utterance id {id:?}"))
                    })?;
                    let utt = utts.get(id).expect("id from utterances").clone();
                    let normalised = pre.text_normalisation(utt);
                    let (abutt, norm_da, labels) =
                        pre.values2category_labels_in_da(&normalised, da);
                    utts.insert(id.clone(), normalised);
                    abutts.insert(id.clone(), AbstractedHyp::Utterance(abutt));
                    self.das.insert(id.clone(), norm_da);
                    self.category_labels.insert(id.clone(), labels);
                }
                self.abutterances = Some(abutts);
            }
            // ...or, learning from utterance hypotheses: normalise each
            // hypothesis and abstract via the best one.
            else if let Some(nbls) = &mut utt_nblists {
                let mut abutts = BTreeMap::new();
                for id in &self.utt_ids {
                    let da = self.das.get(id).ok_or_else(|| {
                        SluError::Configuration(format!("no DA for utterance id {id:?}"))
                    })?;
                    let nblist = nbls.get_mut(id).expect("id from nblists");
                    for (_, hyp) in nblist.iter_mut() {
                        *hyp = pre.text_normalisation(hyp.clone());
                    }
                    if let Some((_, best)) = nblist.first() {
                        let (abutt, norm_da, labels) =
                            pre.values2category_labels_in_da(best, da);
                        abutts.insert(id.clone(), AbstractedHyp::Utterance(abutt));
                        self.das.insert(id.clone(), norm_da);
                        self.category_labels.insert(id.clone(), labels);
                    }
                }
                self.abutterances = Some(abutts);
            }
        }

        self.utterances = utterances.map(|utts| {
            utts.into_iter()
                .map(|(id, utt)| (id, InputHyp::Utterance(utt)))
                .collect()
        });
        self.utt_nblists = utt_nblists;

        // Generate the per-utterance feature cache over all instantiations.
        let mut cache = BTreeMap::new();
        for id in &self.utt_ids {
            let features = self
                .assembler
                .assemble(self.assembly_input(id), &Instantiation::All)?;
            cache.insert(id.clone(), features);
        }
        self.utterance_features = Some(cache);

        // Count DAIs over the (possibly normalised) training DAs.
        self.catalogue = DaiCatalogue::new();
        for id in &self.utt_ids {
            if let Some(da) = self.das.get(id) {
                self.catalogue.count_da(da, self.assembler.abstractions());
            }
        }

        info!(n_utts = self.utt_ids.len(), "done extracting features");
        Ok(())
    }

    fn assembly_input(&self, id: &str) -> AssemblyInput<'_> {
        AssemblyInput {
            utt: self.utterances.as_ref().and_then(|m| m.get(id)),
            abutt: self.abutterances.as_ref().and_then(|m| m.get(id)),
            prev_da: self.prev_das.as_ref().and_then(|m| m.get(id)),
            utt_nblist: self.utt_nblists.as_ref().and_then(|m| m.get(id)),
            da_nblist: self.da_nblists.as_ref().and_then(|m| m.get(id)),
            da_nblist_orig: self.da_nblists_orig.as_ref().and_then(|m| m.get(id)),
        }
    }

    /// The assembly input of one training row: the utterance and its
    /// abstracted twin only, matching what the decoder computes per
    /// instantiation.
    fn row_input(&self, id: &str) -> AssemblyInput<'_> {
        AssemblyInput {
            utt: self.utterances.as_ref().and_then(|m| m.get(id)),
            abutt: self.abutterances.as_ref().and_then(|m| m.get(id)),
            ..Default::default()
        }
    }

    /// Prunes features that occur few times. Defaults: 5 occurrences, 4 for
    /// concrete features.
    pub fn prune_features(
        &mut self,
        min_feature_count: Option<usize>,
        min_conc_feature_count: Option<usize>,
    ) -> SluResult<()> {
        let min_feat = min_feature_count.unwrap_or(5);
        let min_conc = min_conc_feature_count.unwrap_or(4);
        if min_feature_count.is_some() {
            // Remembered as the adaptive pruning default during training.
            self.default_min_feat_count = min_feat;
        }

        let cache = self.utterance_features.take().ok_or_else(|| {
            SluError::Configuration("extract_features must be called before prune_features".into())
        })?;
        for features in cache.values() {
            self.registry.count_features(features);
        }
        info!(n_features = self.registry.n_counted(), "done counting features");

        self.registry
            .prune(min_feat, min_conc, &self.assembler.concrete_set_idxs());
        // The cache was moved out above and is dropped here, bounding
        // memory for the rest of training.
        Ok(())
    }

    /// Prunes classifiers for DAIs that cannot be reliably classified with
    /// these training data.
    pub fn prune_classifiers<F>(
        &mut self,
        min_dai_count: usize,
        min_correct_count: Option<usize>,
        min_incorrect_count: Option<usize>,
        accept_dai: Option<F>,
    ) where
        F: Fn(&DialogueActItem, usize) -> bool,
    {
        if let Some(min_correct) = min_correct_count {
            self.default_min_correct_dai_count = min_correct;
        }
        if let Some(min_incorrect) = min_incorrect_count {
            self.default_min_incorrect_dai_count = min_incorrect;
        }
        self.catalogue.prune(min_dai_count, accept_dai);
    }

    // ========== Instantiation engine ==========

    /// Candidate slot-value instantiations of a DAI in an abstracted
    /// hypothesis.
    fn compatible_insts(dai: &DialogueActItem, ab: &AbstractedHyp) -> Vec<SlotInstantiation> {
        let catlab_words = dai.category_label_words();
        if dai.is_generic {
            ab.insts_for_type(&catlab_words)
        } else {
            let value = dai
                .orig_values
                .iter()
                .next()
                .cloned()
                .or_else(|| dai.value.clone())
                .unwrap_or_default();
            let value_words: Vec<String> =
                value.split_whitespace().map(str::to_string).collect();
            ab.insts_for_typeval(&catlab_words, &value_words)
        }
    }

    /// The instantiated DAI evaluated against a training DA or emitted into
    /// the output confusion network.
    fn instantiated_dai(dai: &DialogueActItem, value: &[String]) -> DialogueActItem {
        let mut inst = DialogueActItem {
            act_type: dai.act_type.clone(),
            slot: dai.slot.clone(),
            value: Some(value.join(" ")),
            ..Default::default()
        };
        if let Some(catlab) = &dai.value {
            inst.value_to_category_label(catlab.clone());
        }
        inst
    }

    /// Generate the training rows of one DAI: one row per instantiation,
    /// or a single non-instantiated row when the hypothesis has no anchor.
    fn build_rows(&self, dai: &DialogueActItem) -> SluResult<(Vec<Vec<(usize, f64)>>, Vec<u8>)> {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for id in &self.utt_ids {
            let da = match self.das.get(id) {
                Some(da) => da,
                None => continue,
            };
            let insts = self
                .abutterances
                .as_ref()
                .and_then(|m| m.get(id))
                .map(|ab| Self::compatible_insts(dai, ab))
                .unwrap_or_default();
            if insts.is_empty() {
                labels.push(da.contains(dai) as u8);
                let features = self
                    .assembler
                    .assemble(self.row_input(id), &Instantiation::None)?;
                rows.push(features.sparse_pairs(&self.registry));
            } else {
                for (label, value) in insts {
                    let inst_dai = Self::instantiated_dai(dai, &value);
                    labels.push(da.contains(&inst_dai) as u8);
                    let features = self.assembler.assemble(
                        self.row_input(id),
                        &Instantiation::Concrete { label, value },
                    )?;
                    rows.push(features.sparse_pairs(&self.registry));
                }
            }
        }
        Ok((rows, labels))
    }

    // ========== Training ==========

    /// Resample rows with replacement until both classes reach the prior
    /// maximum count. The augmented rows follow the originals.
    pub fn balance_data(
        inputs: &CsrMatrix,
        outputs: &[u8],
        rng: &mut impl Rng,
    ) -> (CsrMatrix, Vec<u8>) {
        let mut by_class: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
        for (idx, label) in outputs.iter().enumerate() {
            by_class.entry(*label).or_default().push(idx);
        }
        let max_count = by_class.values().map(Vec::len).max().unwrap_or(0);

        let mut rows: Vec<usize> = (0..inputs.n_rows()).collect();
        let mut labels = outputs.to_vec();
        for (label, idxs) in &by_class {
            for _ in idxs.len()..max_count {
                rows.push(idxs[rng.random_range(0..idxs.len())]);
                labels.push(*label);
            }
        }
        (inputs.select_rows(&rows), labels)
    }

    /// Train classifiers for every DAI left in the catalogue. Per-DAI
    /// failures are collated in the report; they never abort the loop.
    pub fn train(&mut self, opts: &TrainOpts) -> SluResult<TrainReport> {
        let min_feature_count = opts
            .min_feature_count
            .unwrap_or(self.default_min_feat_count);
        let min_correct = opts
            .min_correct_dai_count
            .unwrap_or(self.default_min_correct_dai_count);
        let min_incorrect = opts
            .min_incorrect_dai_count
            .unwrap_or(self.default_min_incorrect_dai_count);

        self.logistic_models.clear();
        self.tree_models.clear();
        self.cls_thresholds.clear();

        let mut report = TrainReport::default();
        let dais: Vec<DialogueActItem> = self.catalogue.counts().keys().cloned().collect();

        for dai in dais {
            info!(dai = %dai, "training classifier");
            let (rows, labels) = self.build_rows(&dai)?;

            let n_pos = labels.iter().filter(|&&y| y == 1).count();
            let n_neg = labels.len() - n_pos;
            debug!(support = labels.len(), n_pos, n_neg, "training support");
            if n_pos < min_correct {
                warn!(dai = %dai, n_pos, "not enough positive examples");
                report.skipped.push((
                    dai,
                    SkipReason::NotEnoughPositive {
                        n_pos,
                        required: min_correct,
                    },
                ));
                continue;
            }
            if n_neg < min_incorrect {
                warn!(dai = %dai, n_neg, "not enough negative examples");
                report.skipped.push((
                    dai,
                    SkipReason::NotEnoughNegative {
                        n_neg,
                        required: min_incorrect,
                    },
                ));
                continue;
            }

            let mut inputs = CsrMatrix::new(self.registry.len());
            for row in &rows {
                inputs.push_row(row);
            }

            // Adaptive per-DAI feature pruning.
            let occupancy = inputs.column_occupancy();
            let zeroed: Vec<bool> = occupancy.iter().map(|&n| n < min_feature_count).collect();
            let n_feats_used = zeroed.iter().filter(|&&z| !z).count();
            inputs.zero_columns_and_crop(&zeroed);
            debug!(n_feats_used, "adaptively pruned features");
            if n_feats_used == 0 {
                warn!(dai = %dai, "no features, no training");
                report.skipped.push((dai, SkipReason::NoFeatures));
                continue;
            }

            let (bal_inputs, bal_labels) = if opts.balance {
                Self::balance_data(&inputs, &labels, &mut self.rng)
            } else {
                (inputs.clone(), labels.clone())
            };

            let fitted = match self.clser_type {
                ClassifierType::Logistic => {
                    let log_opts = LogisticOptions {
                        c: opts.sparsification,
                        ..Default::default()
                    };
                    fit_logistic(&bal_inputs, &bal_labels, &log_opts).map(|params| {
                        debug!(nonzero = params.coefs.nnz(), "nonzero parameters");
                        self.logistic_models.insert(dai.clone(), params);
                    })
                }
                ClassifierType::Tree => {
                    DecisionTree::fit(
                        &bal_inputs.to_dense_rows(),
                        &bal_labels,
                        &TreeOptions::default(),
                    )
                    .map(|tree| {
                        debug!(nodes = tree.node_count(), "tree size");
                        self.tree_models.insert(dai.clone(), tree);
                    })
                }
            };
            if let Err(err) = fitted {
                warn!(dai = %dai, error = %err, "fit failed");
                report.skipped.push((dai, SkipReason::Fit(err.to_string())));
                continue;
            }

            // Calibrate the decision threshold on the unbalanced rows.
            if opts.calibrate {
                let calib_data: Vec<(f64, u8)> = (0..inputs.n_rows())
                    .map(|row| (self.predict_matrix_row(&dai, &inputs, row), labels[row]))
                    .collect();
                let threshold = calibrate_threshold(&calib_data);
                self.cls_thresholds.insert(dai.clone(), threshold);
            }

            report.fitted.push(dai);
        }

        info!(
            fitted = report.fitted.len(),
            skipped = report.skipped.len(),
            "done training"
        );
        Ok(report)
    }

    fn predict_matrix_row(&self, dai: &DialogueActItem, inputs: &CsrMatrix, row: usize) -> f64 {
        match self.clser_type {
            ClassifierType::Logistic => {
                let params = &self.logistic_models[dai];
                let mut weights = vec![0.0; inputs.n_cols()];
                for (idx, val) in params.coefs.iter() {
                    weights[idx] = val;
                }
                sigmoid(inputs.row_score(row, &weights, params.intercept))
            }
            ClassifierType::Tree => {
                let mut dense = vec![0.0; inputs.n_cols()];
                for (col, val) in inputs.row(row) {
                    dense[col] += val;
                }
                self.tree_models[dai].predict_prob(&dense)
            }
        }
    }

    /// `P(dai | x)` for a dense feature vector.
    pub fn predict_prob(&self, dai: &DialogueActItem, feat_vec: &[f64]) -> SluResult<f64> {
        match self.clser_type {
            ClassifierType::Logistic => self
                .logistic_models
                .get(dai)
                .map(|params| params.predict_prob(feat_vec))
                .ok_or_else(|| SluError::Prediction(format!("no classifier for {dai}"))),
            ClassifierType::Tree => self
                .tree_models
                .get(dai)
                .map(|tree| tree.predict_prob(feat_vec))
                .ok_or_else(|| SluError::Prediction(format!("no classifier for {dai}"))),
        }
    }

    // ========== Decoding ==========

    /// Parses an utterance into a confusion network of dialogue acts.
    pub fn parse_1_best(
        &self,
        input: ParseInput<'_>,
        combine: CombineMethod,
    ) -> SluResult<DaiConfusionNetwork> {
        self.parse_1_best_with_map(input, combine).map(|(cn, _)| cn)
    }

    /// Like [`Self::parse_1_best`], additionally returning the category
    /// labels identified in the utterance.
    pub fn parse_1_best_with_map(
        &self,
        input: ParseInput<'_>,
        combine: CombineMethod,
    ) -> SluResult<(DaiConfusionNetwork, CategoryLabelMap)> {
        let mut utterance = input.utterance.cloned();
        let mut abutt: Option<AbstractedHyp> = None;
        let mut category_labels = CategoryLabelMap::new();

        if let Some(pre) = &self.preprocessing {
            if let Some(utt) = utterance.take() {
                let normalised = pre.text_normalisation(utt);
                let (ab, labels) = pre.values2category_labels_in_utterance(&normalised);
                debug!(utterance = %normalised, "after preprocessing");
                abutt = Some(AbstractedHyp::Utterance(ab));
                category_labels = labels;
                utterance = Some(normalised);
            }
        }

        let utt_hyp = utterance.map(InputHyp::Utterance);
        let assembly = AssemblyInput {
            utt: utt_hyp.as_ref(),
            abutt: abutt.as_ref(),
            prev_da: input.prev_da,
            utt_nblist: input.utt_nblist,
            da_nblist: input.da_nblist,
            da_nblist_orig: input.da_nblist_orig,
        };
        let conc_feat_vec = self
            .assembler
            .assemble(assembly, &Instantiation::None)?
            .feature_vector(&self.registry);

        let mut confnet = DaiConfusionNetwork::new();
        for dai in self.trained_dais() {
            let insts = abutt
                .as_ref()
                .map(|ab| Self::compatible_insts(dai, ab))
                .unwrap_or_default();

            if !insts.is_empty() {
                for (label, value) in insts {
                    let inst_input = AssemblyInput {
                        utt: utt_hyp.as_ref(),
                        abutt: abutt.as_ref(),
                        ..Default::default()
                    };
                    let feat_vec = self
                        .assembler
                        .assemble(inst_input, &Instantiation::Concrete {
                            label,
                            value: value.clone(),
                        })?
                        .feature_vector(&self.registry);
                    let prob = match self.predict_prob(dai, &feat_vec) {
                        Ok(prob) => prob,
                        Err(err) => {
                            warn!(dai = %dai, error = %err, "parsing error, skipping");
                            continue;
                        }
                    };
                    let inst_dai = Self::instantiated_dai(dai, &value);
                    confnet.add_merge(prob, inst_dai, combine);
                }
            } else if dai.is_generic {
                // No anchor in the input for an abstract classifier.
                continue;
            } else {
                let prob = match self.predict_prob(dai, &conc_feat_vec) {
                    Ok(prob) => prob,
                    Err(err) => {
                        warn!(dai = %dai, error = %err, "parsing error, skipping");
                        continue;
                    }
                };
                confnet.add_merge(prob, dai.clone(), combine);
            }
        }

        let mut confnet = match &self.preprocessing {
            Some(pre) => pre.category_labels2values_in_confnet(&confnet, &category_labels),
            None => confnet,
        };
        confnet.sort();

        // Back off to the DA n-best list for items we have no classifier
        // for, keeping their original probabilities.
        if let Some(nblist) = input.da_nblist.or(input.da_nblist_orig) {
            for (prob, da) in nblist {
                for dai in da.iter() {
                    if !confnet.contains(dai) {
                        confnet.add(*prob, dai.clone());
                    }
                }
            }
            confnet.sort();
        }

        Ok((confnet, category_labels))
    }

    /// Parse an n-best list by parsing each hypothesis and merging the
    /// resulting networks, weighted by the hypothesis probabilities.
    pub fn parse_nblist(&self, utterance_list: &[(f64, Utterance)]) -> SluResult<DaiConfusionNetwork> {
        if utterance_list.is_empty() {
            return Ok(DaiConfusionNetwork::new());
        }

        let mut confnet_hyps = Vec::with_capacity(utterance_list.len());
        for (prob, utt) in utterance_list {
            let confnet = if utt.words() == ["__other__"] {
                let mut cn = DaiConfusionNetwork::new();
                cn.add(1.0, DialogueActItem::other());
                cn
            } else {
                self.parse_1_best(
                    ParseInput {
                        utterance: Some(utt),
                        ..Default::default()
                    },
                    CombineMethod::default(),
                )?
            };
            confnet_hyps.push((*prob, confnet));
        }

        let mut confnet = merge_slu_confnets(&confnet_hyps);
        confnet.prune(PRUNE_PROB);
        confnet.sort();
        Ok(confnet)
    }

    /// Parse an utterance confusion network with the same pipeline, using
    /// confnet-typed feature extraction.
    pub fn parse_confnet(
        &self,
        confnet: &UtteranceConfnet,
        include_other: bool,
        combine: CombineMethod,
    ) -> SluResult<DaiConfusionNetwork> {
        let (input_cn, ab, category_labels) = match &self.preprocessing {
            Some(pre) => {
                let normalised = pre.normalise_confnet(confnet.clone());
                let (ab_cn, labels) = pre.values2category_labels_in_confnet(&normalised);
                (normalised, AbstractedHyp::Confnet(ab_cn), labels)
            }
            None => (
                confnet.clone(),
                AbstractedHyp::Confnet(crate::utterance::AbstractedConfnet::from_plain(confnet)),
                CategoryLabelMap::new(),
            ),
        };

        let cn_hyp = InputHyp::Confnet(input_cn);
        let assembly = AssemblyInput {
            utt: Some(&cn_hyp),
            abutt: Some(&ab),
            ..Default::default()
        };
        let conc_feat_vec = self
            .assembler
            .assemble(assembly, &Instantiation::None)?
            .feature_vector(&self.registry);

        let mut out = DaiConfusionNetwork::new();
        for dai in self.trained_dais() {
            let insts = Self::compatible_insts(dai, &ab);
            if !insts.is_empty() {
                for (label, value) in insts {
                    if !include_other && value.join(" ") == DialogueActItem::OTHER_VAL {
                        continue;
                    }
                    let feat_vec = self
                        .assembler
                        .assemble(assembly, &Instantiation::Concrete {
                            label,
                            value: value.clone(),
                        })?
                        .feature_vector(&self.registry);
                    let prob = match self.predict_prob(dai, &feat_vec) {
                        Ok(prob) => prob,
                        Err(err) => {
                            warn!(dai = %dai, error = %err, "parsing error, skipping");
                            continue;
                        }
                    };
                    out.add_merge(prob, Self::instantiated_dai(dai, &value), combine);
                }
            } else if dai.is_generic
                || (!include_other
                    && dai.orig_values.contains(DialogueActItem::OTHER_VAL))
            {
                continue;
            } else {
                let prob = match self.predict_prob(dai, &conc_feat_vec) {
                    Ok(prob) => prob,
                    Err(err) => {
                        warn!(dai = %dai, error = %err, "parsing error, skipping");
                        continue;
                    }
                };
                out.add_merge(prob, dai.clone(), combine);
            }
        }

        let mut out = match &self.preprocessing {
            Some(pre) => pre.category_labels2values_in_confnet(&out, &category_labels),
            None => out,
        };
        out.sort();
        Ok(out)
    }

    // ========== Model store ==========

    /// Drop features that no classifier's decision depends on, compacting
    /// the feature index space. Logistic models only.
    pub fn forget_useless_feats(&mut self) {
        if self.clser_type != ClassifierType::Logistic {
            return;
        }
        let mut used: BTreeSet<usize> = BTreeSet::new();
        for params in self.logistic_models.values() {
            used.extend(params.coefs.nonzero_idxs().iter().copied());
        }
        let old2new: ahash::AHashMap<usize, usize> = used
            .iter()
            .enumerate()
            .map(|(new, old)| (*old, new))
            .collect();

        self.registry.compact(&old2new);
        for params in self.logistic_models.values_mut() {
            params.coefs = params.coefs.remap(&old2new);
        }
        info!(n_features = self.registry.len(), "reduced model features");
    }

    /// Export the model. With `do_reduce`, useless features are forgotten
    /// first. Compression follows the `.gz` suffix unless overridden.
    pub fn save_model(
        &mut self,
        path: impl AsRef<std::path::Path>,
        do_reduce: bool,
        gzip: Option<bool>,
    ) -> SluResult<()> {
        if do_reduce {
            self.forget_useless_feats();
        }
        let payload = match self.clser_type {
            ClassifierType::Logistic => ClassifierPayload::Logistic {
                intercepts: self
                    .logistic_models
                    .iter()
                    .map(|(dai, params)| (dai.clone(), params.intercept))
                    .collect(),
                coefs: self
                    .logistic_models
                    .iter()
                    .map(|(dai, params)| (dai.clone(), params.coefs.clone()))
                    .collect(),
            },
            ClassifierType::Tree => ClassifierPayload::Tree {
                trees: self.tree_models.clone(),
            },
        };
        let stored = StoredModel {
            feature_idxs: self.registry.to_index_pairs(),
            clser_type: self.clser_type,
            payload,
            features_type: self.assembler.features_type().clone(),
            features_size: self.assembler.features_size(),
            cls_thresholds: self.cls_thresholds.clone(),
            abstractions: self.assembler.abstractions().clone(),
        };
        stored.save(path, gzip)
    }

    /// Load a model saved by any supported artefact version.
    pub fn load_model(&mut self, path: impl AsRef<std::path::Path>) -> SluResult<()> {
        let stored = StoredModel::load(path)?;
        self.registry = FeatureRegistry::from_index_pairs(stored.feature_idxs);
        self.clser_type = stored.clser_type;
        self.assembler = FeatureAssembler::new(
            stored.features_type,
            stored.features_size,
            stored.abstractions,
        );
        self.cls_thresholds = stored.cls_thresholds;
        self.logistic_models.clear();
        self.tree_models.clear();
        match stored.payload {
            ClassifierPayload::Logistic { intercepts, coefs } => {
                for (dai, coefs) in coefs {
                    let intercept = intercepts.get(&dai).copied().unwrap_or(0.0);
                    self.logistic_models
                        .insert(dai, LogisticParams { intercept, coefs });
                }
            }
            ClassifierPayload::Tree { trees } => {
                self.tree_models = trees;
            }
        }
        Ok(())
    }
}
