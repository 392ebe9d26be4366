//! The DAI catalogue: which dialogue-act items get their own classifier.
//!
//! Counting buckets every training DAI under its generic twin and, when the
//! concrete abstraction is configured, under its exact form as well.
//! Pruning then drops items that cannot be classified reliably; a rejected
//! DAI simply has no classifier, which at decode time means probability 0.

use std::collections::BTreeSet;

use tracing::info;

use crate::assembler::Abstraction;
use crate::da::{DaiCounts, DialogueAct, DialogueActItem};

#[derive(Debug, Clone, Default)]
pub struct DaiCatalogue {
    dai_counts: DaiCounts,
}

impl DaiCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the DAIs of one training dialogue act.
    pub fn count_da(&mut self, da: &DialogueAct, abstractions: &BTreeSet<Abstraction>) {
        for dai in da.iter() {
            let gen_dai = dai.get_generic();
            let concrete_too =
                abstractions.contains(&Abstraction::Concrete) && gen_dai != *dai;
            *self.dai_counts.entry(gen_dai).or_insert(0) += 1;
            if concrete_too {
                *self.dai_counts.entry(dai.clone()).or_insert(0) += 1;
            }
        }
    }

    pub fn counts(&self) -> &DaiCounts {
        &self.dai_counts
    }

    pub fn count_of(&self, dai: &DialogueActItem) -> usize {
        self.dai_counts.get(dai).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.dai_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dai_counts.is_empty()
    }

    /// The default accept predicate:
    /// - keep all generic classifiers;
    /// - drop items with both slot and value set that occur fewer than
    ///   `min_dai_count` times;
    /// - drop `(slot="[OTHER]")` and `(slot="dontcare")` items;
    /// - drop the null act.
    pub fn default_accept(dai: &DialogueActItem, count: usize, min_dai_count: usize) -> bool {
        if dai.is_generic {
            return true;
        }
        if dai.slot.is_some() && dai.value.is_some() && count < min_dai_count {
            return false;
        }
        if dai.value.as_deref() == Some(DialogueActItem::OTHER_VAL) {
            return false;
        }
        if dai.slot.is_some() && dai.value.as_deref() == Some("dontcare") {
            return false;
        }
        !dai.is_null()
    }

    /// Prune classifiers for DAIs rejected by the predicate. When no custom
    /// predicate is given, [`Self::default_accept`] is applied with the
    /// given `min_dai_count`.
    pub fn prune<F>(&mut self, min_dai_count: usize, accept_dai: Option<F>)
    where
        F: Fn(&DialogueActItem, usize) -> bool,
    {
        let before = self.dai_counts.len();
        match accept_dai {
            Some(accept) => self.dai_counts.retain(|dai, count| accept(dai, *count)),
            None => self
                .dai_counts
                .retain(|dai, count| Self::default_accept(dai, *count, min_dai_count)),
        }
        info!(before, after = self.dai_counts.len(), "pruned classifiers");
    }
}
