//! Feature registry: interns features into dense indices and prunes rare
//! ones.
//!
//! During the counting pass the registry is append-only; pruning freezes it
//! and assigns contiguous indices `[0, m)`. Concrete features (those whose
//! set index belongs to a concrete feature set) are held to their own
//! occurrence threshold.

use ahash::AHashMap;
use tracing::info;

use crate::features::{Feature, JointFeatures};

#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    feature_idxs: AHashMap<Feature, usize>,
    idx2feature: Vec<Feature>,
    feat_counts: AHashMap<Feature, usize>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the features of one training example.
    pub fn count_features(&mut self, features: &JointFeatures) {
        for (feat, _) in features.iter() {
            *self.feat_counts.entry(feat.clone()).or_insert(0) += 1;
        }
    }

    /// Occurrence count of a feature, if it survived (or preceded) pruning.
    pub fn count_of(&self, feat: &Feature) -> Option<usize> {
        self.feat_counts.get(feat).copied()
    }

    /// Dense index of a feature, once indices have been assigned.
    pub fn index_of(&self, feat: &Feature) -> Option<usize> {
        self.feature_idxs.get(feat).copied()
    }

    pub fn feature_at(&self, idx: usize) -> Option<&Feature> {
        self.idx2feature.get(idx)
    }

    pub fn len(&self) -> usize {
        self.idx2feature.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx2feature.is_empty()
    }

    pub fn n_counted(&self) -> usize {
        self.feat_counts.len()
    }

    /// Drop features occurring fewer times than their applicable threshold
    /// and assign contiguous indices to the survivors. Features produced by
    /// a concrete feature set use `min_conc_feature_count`, all others
    /// `min_feature_count`. Indices are assigned in sorted feature order so
    /// repeated runs on the same data agree.
    pub fn prune(
        &mut self,
        min_feature_count: usize,
        min_conc_feature_count: usize,
        concrete_set_idxs: &[usize],
    ) {
        let before = self.feat_counts.len();
        self.feat_counts.retain(|feat, count| {
            let threshold = if concrete_set_idxs.contains(&feat.set_idx) {
                min_conc_feature_count
            } else {
                min_feature_count
            };
            *count >= threshold
        });

        let mut survivors: Vec<&Feature> = self.feat_counts.keys().collect();
        survivors.sort();

        self.feature_idxs = survivors
            .iter()
            .enumerate()
            .map(|(idx, feat)| ((*feat).clone(), idx))
            .collect();
        self.idx2feature = survivors.into_iter().cloned().collect();

        info!(
            before,
            after = self.idx2feature.len(),
            "pruned feature registry"
        );
    }

    /// Remap surviving features after model reduction: `old2new` maps old
    /// indices onto the compacted range; unmapped features are dropped.
    pub fn compact(&mut self, old2new: &AHashMap<usize, usize>) {
        self.feature_idxs.retain(|_, idx| old2new.contains_key(idx));
        for idx in self.feature_idxs.values_mut() {
            *idx = old2new[idx];
        }
        let mut idx2feature = vec![None; old2new.len()];
        for (feat, idx) in &self.feature_idxs {
            idx2feature[*idx] = Some(feat.clone());
        }
        self.idx2feature = idx2feature.into_iter().flatten().collect();
        self.feat_counts.retain(|feat, _| self.feature_idxs.contains_key(feat));
    }

    /// Restore a registry from a stored index map (loading a model).
    pub fn from_index_pairs(pairs: Vec<(Feature, usize)>) -> Self {
        let mut idx2feature = vec![None; pairs.len()];
        let mut feature_idxs = AHashMap::with_capacity(pairs.len());
        for (feat, idx) in pairs {
            if idx < idx2feature.len() {
                idx2feature[idx] = Some(feat.clone());
            }
            feature_idxs.insert(feat, idx);
        }
        Self {
            feature_idxs,
            idx2feature: idx2feature.into_iter().flatten().collect(),
            feat_counts: AHashMap::new(),
        }
    }

    /// The stored form of the index map, in index order.
    pub fn to_index_pairs(&self) -> Vec<(Feature, usize)> {
        let mut pairs: Vec<(Feature, usize)> = self
            .feature_idxs
            .iter()
            .map(|(f, i)| (f.clone(), *i))
            .collect();
        pairs.sort_by_key(|(_, i)| *i);
        pairs
    }
}
