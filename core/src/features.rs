//! Feature tags and the sub-extractors that produce them.
//!
//! Each sub-extractor emits a [`FeatureSet`]: a map from feature tags to
//! real values. The assembler joins the sets of one example into
//! [`JointFeatures`], where every tag is paired with the index of the set
//! that produced it; the pruner needs that index to tell concrete features
//! from abstract ones.
//!
//! N-gram extraction covers contiguous n-grams up to the configured order
//! plus skip n-grams (first and last word of a window with the interior
//! collapsed to [`SKIP`]), over either utterance tokens or confusion-network
//! links.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::da::DialogueAct;
use crate::registry::FeatureRegistry;
use crate::utterance::{DaNbList, InputHyp, Utterance, UtteranceConfnet, UtteranceNbList};

/// Marker token standing for skipped words inside a skip n-gram.
pub const SKIP: &str = "*";

/// The payload of a feature, before it is bound to a feature set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureTag {
    /// A (possibly skip) n-gram of words or lattice links.
    Ngram(Vec<String>),
    /// Presence of an act type in a DA.
    DaiAct(String),
    /// Presence of an act type with a slot.
    DaiActSlot(String, String),
    /// Presence of a full dialogue-act item.
    DaiFull(String, String, String),
    /// Length of an n-best list.
    NblSize(usize),
}

/// A feature as registered: the index of the producing feature set plus the
/// tag itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Feature {
    pub set_idx: usize,
    pub tag: FeatureTag,
}

/// One sub-extractor's output: tag → value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    values: AHashMap<FeatureTag, f64>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tag: FeatureTag, value: f64) {
        *self.values.entry(tag).or_insert(0.0) += value;
    }

    /// Merge another set into this one, summing values. Used when joining
    /// the features of all instantiations of one utterance into a single
    /// set.
    pub fn merge_add(&mut self, other: FeatureSet) {
        for (tag, value) in other.values {
            *self.values.entry(tag).or_insert(0.0) += value;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FeatureTag, &f64)> {
        self.values.iter()
    }
}

/// The joined features of one training or decoding example.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointFeatures {
    values: AHashMap<Feature, f64>,
}

impl JointFeatures {
    /// Join feature sets; the set index is the position in the list.
    pub fn join(sets: Vec<FeatureSet>) -> Self {
        let mut values = AHashMap::new();
        for (set_idx, set) in sets.into_iter().enumerate() {
            for (tag, value) in set.values {
                *values.entry(Feature { set_idx, tag }).or_insert(0.0) += value;
            }
        }
        Self { values }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Feature, &f64)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sparse `(index, value)` pairs against a frozen registry; features
    /// unknown to the registry contribute nothing.
    pub fn sparse_pairs(&self, registry: &FeatureRegistry) -> Vec<(usize, f64)> {
        let mut pairs: Vec<(usize, f64)> = self
            .values
            .iter()
            .filter_map(|(feat, val)| registry.index_of(feat).map(|idx| (idx, *val)))
            .collect();
        pairs.sort_by_key(|(idx, _)| *idx);
        pairs
    }

    /// Dense feature vector against a frozen registry.
    pub fn feature_vector(&self, registry: &FeatureRegistry) -> Vec<f64> {
        let mut vec = vec![0.0; registry.len()];
        for (feat, val) in &self.values {
            if let Some(idx) = registry.index_of(feat) {
                vec[idx] += *val;
            }
        }
        vec
    }
}

/// Contiguous and skip n-grams over a token sequence.
pub fn ngram_features(words: &[String], size: usize) -> FeatureSet {
    let mut set = FeatureSet::new();
    for n in 1..=size.max(1) {
        if words.len() < n {
            break;
        }
        for window in words.windows(n) {
            set.add(FeatureTag::Ngram(window.to_vec()), 1.0);
            if n >= 3 {
                let skip = vec![
                    window[0].clone(),
                    SKIP.to_string(),
                    window[n - 1].clone(),
                ];
                set.add(FeatureTag::Ngram(skip), 1.0);
            }
        }
    }
    set
}

/// N-grams over confusion-network links, weighted by the product of the
/// link probabilities along each path through the window.
pub fn confnet_ngram_features(confnet: &UtteranceConfnet, size: usize) -> FeatureSet {
    let mut set = FeatureSet::new();
    let links = confnet.links();
    for n in 1..=size.max(1) {
        if links.len() < n {
            break;
        }
        for start in 0..=links.len() - n {
            let window = &links[start..start + n];
            let mut paths: Vec<(f64, Vec<String>)> = vec![(1.0, Vec::new())];
            for alts in window {
                let mut next = Vec::with_capacity(paths.len() * alts.len());
                for (prob, words) in &paths {
                    for (p, w) in alts {
                        let mut words = words.clone();
                        words.push(w.clone());
                        next.push((prob * p, words));
                    }
                }
                paths = next;
            }
            for (prob, words) in paths {
                if prob <= 0.0 {
                    continue;
                }
                if n >= 3 {
                    let skip = vec![words[0].clone(), SKIP.to_string(), words[n - 1].clone()];
                    set.add(FeatureTag::Ngram(skip), prob);
                }
                set.add(FeatureTag::Ngram(words), prob);
            }
        }
    }
    set
}

/// N-gram features of an input hypothesis, dispatching on its kind.
pub fn hyp_ngram_features(hyp: &InputHyp, size: usize) -> FeatureSet {
    match hyp {
        InputHyp::Utterance(utt) => ngram_features(utt.words(), size),
        InputHyp::Confnet(cn) => confnet_ngram_features(cn, size),
    }
}

/// Features of a dialogue act: act type, act-with-slot, and the full item.
pub fn da_features(da: &DialogueAct) -> FeatureSet {
    let mut set = FeatureSet::new();
    weighted_da_features(&mut set, da, 1.0);
    set
}

fn weighted_da_features(set: &mut FeatureSet, da: &DialogueAct, weight: f64) {
    for dai in da.iter() {
        set.add(FeatureTag::DaiAct(dai.act_type.clone()), weight);
        if let Some(slot) = &dai.slot {
            set.add(
                FeatureTag::DaiActSlot(dai.act_type.clone(), slot.clone()),
                weight,
            );
            if let Some(value) = &dai.value {
                set.add(
                    FeatureTag::DaiFull(dai.act_type.clone(), slot.clone(), value.clone()),
                    weight,
                );
            }
        }
    }
}

/// Features of an utterance n-best list: per-hypothesis n-grams weighted by
/// the hypothesis probability, plus the list length.
pub fn utt_nblist_features(nblist: &UtteranceNbList, size: usize) -> FeatureSet {
    let mut set = FeatureSet::new();
    for (prob, utt) in nblist {
        weighted_ngram_features(&mut set, utt, size, *prob);
    }
    set.add(FeatureTag::NblSize(nblist.len()), 1.0);
    set
}

fn weighted_ngram_features(set: &mut FeatureSet, utt: &Utterance, size: usize, weight: f64) {
    let mut hyp_set = ngram_features(utt.words(), size);
    for value in hyp_set.values.values_mut() {
        *value *= weight;
    }
    set.merge_add(hyp_set);
}

/// Features of a DA n-best list: per-hypothesis DA features weighted by the
/// hypothesis probability, plus the list length.
pub fn da_nblist_features(nblist: &DaNbList) -> FeatureSet {
    let mut set = FeatureSet::new();
    for (prob, da) in nblist {
        weighted_da_features(&mut set, da, *prob);
    }
    set.add(FeatureTag::NblSize(nblist.len()), 1.0);
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::da::DialogueActItem;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn ngrams_cover_all_orders_and_skips() {
        let set = ngram_features(&words("i want chinese food"), 3);
        let unigram = FeatureTag::Ngram(words("want"));
        let bigram = FeatureTag::Ngram(words("chinese food"));
        let trigram = FeatureTag::Ngram(words("i want chinese"));
        let skip = FeatureTag::Ngram(vec!["i".into(), SKIP.into(), "chinese".into()]);
        for tag in [unigram, bigram, trigram, skip] {
            assert!(set.iter().any(|(t, _)| *t == tag), "missing {tag:?}");
        }
    }

    #[test]
    fn confnet_ngrams_weight_by_path_probability() {
        let cn = UtteranceConfnet::new(vec![
            vec![(0.6, "hello".into()), (0.4, "yellow".into())],
            vec![(1.0, "there".into())],
        ]);
        let set = confnet_ngram_features(&cn, 2);
        let hello_there = FeatureTag::Ngram(words("hello there"));
        let got = set
            .iter()
            .find(|(t, _)| **t == hello_there)
            .map(|(_, v)| *v)
            .unwrap();
        assert!((got - 0.6).abs() < 1e-12);
    }

    #[test]
    fn join_assigns_set_indices_by_position() {
        let mut a = FeatureSet::new();
        a.add(FeatureTag::Ngram(words("hello")), 1.0);
        let mut b = FeatureSet::new();
        b.add(FeatureTag::Ngram(words("hello")), 1.0);
        let joint = JointFeatures::join(vec![a, b]);
        assert_eq!(joint.len(), 2);
        assert!(joint.iter().all(|(f, _)| f.set_idx < 2));
    }

    #[test]
    fn da_features_cover_act_slot_value() {
        let mut da = DialogueAct::new();
        da.insert(DialogueActItem::with_slot_value("inform", "food", "chinese"));
        let set = da_features(&da);
        assert!(set
            .iter()
            .any(|(t, _)| *t == FeatureTag::DaiAct("inform".into())));
        assert!(set.iter().any(|(t, _)| matches!(t, FeatureTag::DaiFull(..))));
    }
}
