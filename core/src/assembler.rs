//! Feature assembler: combines sub-feature-sets into one vector per
//! example.
//!
//! Which sets are produced is governed by the configured feature types and
//! the abstraction set. For the n-gram type the assembler emits one set per
//! abstract view (partial, then abstract) followed by a concrete set when
//! the concrete abstraction is selected; the remaining feature types each
//! contribute one set, empty when their input is missing. The join is a
//! disjoint union keyed by the position of each set.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::da::DialogueAct;
use crate::error::{SluError, SluResult};
use crate::features::{
    da_features, da_nblist_features, hyp_ngram_features, utt_nblist_features, FeatureSet,
    JointFeatures,
};
use crate::utterance::{AbstractedHyp, DaNbList, InputHyp, UtteranceNbList};

/// Which views of the utterance contribute features.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Abstraction {
    /// Features over the raw, non-abstracted utterance.
    Concrete,
    /// Features over instantiations with the concrete value filled in.
    Partial,
    /// Features over instantiations with the category label kept.
    Abstract,
}

/// Recognised feature-type keywords, mix-and-matchable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Ngram,
    PrevDa,
    UttNbl,
    DaNbl,
    DaNblOrig,
}

/// The slot-value instantiation an example is built for.
#[derive(Debug, Clone, PartialEq)]
pub enum Instantiation {
    /// Join features over all instantiations (the counting pass).
    All,
    /// No instantiation: empty placeholders for the abstract views.
    None,
    /// One concrete `(label, value)` assignment.
    Concrete { label: String, value: Vec<String> },
}

/// The inputs one example may draw from. Missing inputs yield empty
/// feature sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblyInput<'a> {
    pub utt: Option<&'a InputHyp>,
    pub abutt: Option<&'a AbstractedHyp>,
    pub prev_da: Option<&'a DialogueAct>,
    pub utt_nblist: Option<&'a UtteranceNbList>,
    pub da_nblist: Option<&'a DaNbList>,
    pub da_nblist_orig: Option<&'a DaNbList>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureAssembler {
    features_type: BTreeSet<FeatureType>,
    features_size: usize,
    abstractions: BTreeSet<Abstraction>,
    /// `do_abstract` values for the abstract n-gram views, in the fixed
    /// order partial (false) then abstract (true).
    do_abstract_values: Vec<bool>,
    /// Number of feature sets per example, recorded at training start.
    n_feat_sets: usize,
}

impl FeatureAssembler {
    pub fn new(
        features_type: BTreeSet<FeatureType>,
        features_size: usize,
        abstractions: BTreeSet<Abstraction>,
    ) -> Self {
        let mut do_abstract_values = Vec::new();
        if abstractions.contains(&Abstraction::Partial) {
            do_abstract_values.push(false);
        }
        if abstractions.contains(&Abstraction::Abstract) {
            do_abstract_values.push(true);
        }
        let mut assembler = Self {
            features_type,
            features_size,
            abstractions,
            do_abstract_values,
            n_feat_sets: 0,
        };
        assembler.n_feat_sets = assembler.count_feat_sets();
        assembler
    }

    pub fn features_type(&self) -> &BTreeSet<FeatureType> {
        &self.features_type
    }

    pub fn features_size(&self) -> usize {
        self.features_size
    }

    pub fn abstractions(&self) -> &BTreeSet<Abstraction> {
        &self.abstractions
    }

    pub fn n_feat_sets(&self) -> usize {
        self.n_feat_sets
    }

    fn count_feat_sets(&self) -> usize {
        let mut n = 0;
        if self.features_type.contains(&FeatureType::Ngram) {
            n += self.do_abstract_values.len();
            if self.abstractions.contains(&Abstraction::Concrete) {
                n += 1;
            }
        }
        for ft in [
            FeatureType::PrevDa,
            FeatureType::UttNbl,
            FeatureType::DaNbl,
            FeatureType::DaNblOrig,
        ] {
            if self.features_type.contains(&ft) {
                n += 1;
            }
        }
        n
    }

    /// Set indices of the concrete feature sets, mirroring the assembly
    /// order: the concrete n-gram set follows the abstract views.
    pub fn concrete_set_idxs(&self) -> Vec<usize> {
        let mut idxs = Vec::new();
        if self.features_type.contains(&FeatureType::Ngram)
            && self.abstractions.contains(&Abstraction::Concrete)
        {
            idxs.push(self.do_abstract_values.len());
        }
        idxs
    }

    /// Assemble the joined features of one example.
    pub fn assemble(
        &self,
        input: AssemblyInput<'_>,
        inst: &Instantiation,
    ) -> SluResult<JointFeatures> {
        let mut sets: Vec<FeatureSet> = Vec::with_capacity(self.n_feat_sets.max(1));
        let size = self.features_size;

        if self.features_type.contains(&FeatureType::Ngram) {
            match inst {
                Instantiation::All => {
                    for &do_abstract in &self.do_abstract_values {
                        let mut joined = FeatureSet::new();
                        if let Some(abutt) = input.abutt {
                            for hyp in abutt.all_instantiations(do_abstract) {
                                joined.merge_add(hyp_ngram_features(&hyp, size));
                            }
                        }
                        sets.push(joined);
                    }
                    if self.abstractions.contains(&Abstraction::Concrete) {
                        sets.push(self.concrete_ngrams(input));
                    }
                }
                Instantiation::None => {
                    for _ in &self.do_abstract_values {
                        sets.push(FeatureSet::new());
                    }
                    sets.push(self.concrete_ngrams(input));
                }
                Instantiation::Concrete { label, value } => {
                    for &do_abstract in &self.do_abstract_values {
                        let set = match input.abutt {
                            Some(abutt) => {
                                let hyp = abutt.instantiate(label, value, do_abstract);
                                hyp_ngram_features(&hyp, size)
                            }
                            None => FeatureSet::new(),
                        };
                        sets.push(set);
                    }
                    if self.abstractions.contains(&Abstraction::Concrete) {
                        sets.push(self.concrete_ngrams(input));
                    }
                }
            }
        }

        if self.features_type.contains(&FeatureType::PrevDa) {
            sets.push(input.prev_da.map(da_features).unwrap_or_default());
        }
        if self.features_type.contains(&FeatureType::UttNbl) {
            sets.push(
                input
                    .utt_nblist
                    .map(|nbl| utt_nblist_features(nbl, size))
                    .unwrap_or_default(),
            );
        }
        if self.features_type.contains(&FeatureType::DaNbl) {
            sets.push(input.da_nblist.map(da_nblist_features).unwrap_or_default());
        }
        if self.features_type.contains(&FeatureType::DaNblOrig) {
            sets.push(
                input
                    .da_nblist_orig
                    .map(da_nblist_features)
                    .unwrap_or_default(),
            );
        }

        if sets.is_empty() {
            return Err(SluError::FeatureConstruction(format!(
                "no feature sets for feature types {:?}",
                self.features_type
            )));
        }
        Ok(JointFeatures::join(sets))
    }

    fn concrete_ngrams(&self, input: AssemblyInput<'_>) -> FeatureSet {
        input
            .utt
            .map(|hyp| hyp_ngram_features(hyp, self.features_size))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utterance::{AbstractedToken, AbstractedUtterance, Utterance};

    fn assembler() -> FeatureAssembler {
        FeatureAssembler::new(
            [FeatureType::Ngram].into_iter().collect(),
            2,
            [Abstraction::Concrete, Abstraction::Abstract]
                .into_iter()
                .collect(),
        )
    }

    fn inputs() -> (InputHyp, AbstractedHyp) {
        let utt: Utterance = "to london please".parse().unwrap();
        let abutt = AbstractedUtterance::new(vec![
            AbstractedToken::Word("to".into()),
            AbstractedToken::Slot {
                label: "CITY".into(),
                value: vec!["london".into()],
            },
            AbstractedToken::Word("please".into()),
        ]);
        (InputHyp::Utterance(utt), AbstractedHyp::Utterance(abutt))
    }

    #[test]
    fn set_count_and_concrete_idx() {
        let asm = assembler();
        assert_eq!(asm.n_feat_sets(), 2);
        assert_eq!(asm.concrete_set_idxs(), vec![1]);
    }

    #[test]
    fn assembly_is_deterministic() {
        let asm = assembler();
        let (utt, abutt) = inputs();
        let input = AssemblyInput {
            utt: Some(&utt),
            abutt: Some(&abutt),
            ..Default::default()
        };
        let a = asm.assemble(input, &Instantiation::All).unwrap();
        let b = asm.assemble(input, &Instantiation::All).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn none_instantiation_has_empty_abstract_placeholders() {
        let asm = assembler();
        let (utt, abutt) = inputs();
        let input = AssemblyInput {
            utt: Some(&utt),
            abutt: Some(&abutt),
            ..Default::default()
        };
        let joint = asm.assemble(input, &Instantiation::None).unwrap();
        // Only the concrete set (index 1) is populated.
        assert!(joint.iter().all(|(f, _)| f.set_idx == 1));
    }

    #[test]
    fn no_feature_types_is_an_error() {
        let asm = FeatureAssembler::new(
            BTreeSet::new(),
            2,
            [Abstraction::Concrete].into_iter().collect(),
        );
        let (utt, _) = inputs();
        let input = AssemblyInput {
            utt: Some(&utt),
            ..Default::default()
        };
        assert!(matches!(
            asm.assemble(input, &Instantiation::All),
            Err(SluError::FeatureConstruction(_))
        ));
    }
}
