//! Utterances, utterance lattices and slot-value abstraction.
//!
//! The decoder accepts either a plain token utterance or an utterance
//! confusion network; the two are carried behind the kind-tagged
//! [`InputHyp`] / [`AbstractedHyp`] pair so feature extractors can select
//! between n-grams over tokens and n-grams over lattice edges.
//!
//! An abstracted hypothesis is the same token sequence with value spans
//! replaced by category-label slots that remember the concrete words they
//! stand for. Instantiating a slot puts either the label (abstract view) or
//! the concrete words (partial view) back into the token stream.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::da::{DaiConfusionNetwork, DialogueAct};

/// A tokenised utterance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    words: Vec<String>,
}

impl Utterance {
    pub fn new(words: Vec<String>) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl FromStr for Utterance {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            words: s.split_whitespace().map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for Utterance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.words.join(" "))
    }
}

/// An utterance confusion network: per-position weighted word alternatives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtteranceConfnet {
    links: Vec<Vec<(f64, String)>>,
}

impl UtteranceConfnet {
    pub fn new(links: Vec<Vec<(f64, String)>>) -> Self {
        Self { links }
    }

    pub fn links(&self) -> &[Vec<(f64, String)>] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// The single best word sequence through the network.
    pub fn best_utterance(&self) -> Utterance {
        let words = self
            .links
            .iter()
            .filter_map(|alts| {
                alts.iter()
                    .max_by(|(pa, _), (pb, _)| pa.partial_cmp(pb).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(_, w)| w.clone())
            })
            .collect();
        Utterance::new(words)
    }
}

/// An ASR n-best list: weighted utterance hypotheses.
pub type UtteranceNbList = Vec<(f64, Utterance)>;

/// An SLU n-best list: weighted dialogue-act hypotheses.
pub type DaNbList = Vec<(f64, DialogueAct)>;

/// One token of an abstracted hypothesis: either a plain word or a slot
/// where a category label stands for recorded value words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbstractedToken {
    Word(String),
    Slot { label: String, value: Vec<String> },
}

impl AbstractedToken {
    /// The fully abstract rendering: plain words stay, slots render as
    /// `LABEL=value` so distinct realisations stay distinguishable.
    fn abstract_word(&self) -> String {
        match self {
            Self::Word(w) => w.clone(),
            Self::Slot { label, value } => format!("{}={}", label, value.join("_")),
        }
    }
}

/// A candidate slot-value instantiation: a category label together with the
/// concrete token sequence found for it in the abstracted hypothesis.
pub type SlotInstantiation = (String, Vec<String>);

/// An utterance with value spans abstracted into category-label slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbstractedUtterance {
    tokens: Vec<AbstractedToken>,
}

impl AbstractedUtterance {
    pub fn new(tokens: Vec<AbstractedToken>) -> Self {
        Self { tokens }
    }

    /// An abstracted view of an utterance with no slots.
    pub fn from_plain(utt: &Utterance) -> Self {
        Self {
            tokens: utt.words().iter().cloned().map(AbstractedToken::Word).collect(),
        }
    }

    fn slots(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.tokens.iter().filter_map(|t| match t {
            AbstractedToken::Slot { label, value } => Some((label, value)),
            AbstractedToken::Word(_) => None,
        })
    }

    /// All slot instantiations present in this hypothesis.
    pub fn instantiations(&self) -> Vec<SlotInstantiation> {
        self.slots().map(|(l, v)| (l.clone(), v.clone())).collect()
    }

    /// One instantiated utterance per slot occurrence.
    pub fn all_instantiations(&self, do_abstract: bool) -> Vec<Utterance> {
        self.instantiations()
            .into_iter()
            .map(|(label, value)| self.instantiate(&label, &value, do_abstract))
            .collect()
    }

    /// Instantiate the slot matching `(label, value)`: with `do_abstract`
    /// the slot becomes the bare label token, otherwise the concrete value
    /// words. Other slots stay in their combined abstract rendering.
    pub fn instantiate(&self, label: &str, value: &[String], do_abstract: bool) -> Utterance {
        let mut words = Vec::with_capacity(self.tokens.len());
        for token in &self.tokens {
            match token {
                AbstractedToken::Word(w) => words.push(w.clone()),
                AbstractedToken::Slot { label: l, value: v } if l == label && v == value => {
                    if do_abstract {
                        words.push(label.to_string());
                    } else {
                        words.extend(value.iter().cloned());
                    }
                }
                other => words.push(other.abstract_word()),
            }
        }
        Utterance::new(words)
    }

    /// Instantiations whose label matches the given category-label words.
    pub fn insts_for_type(&self, type_words: &[String]) -> Vec<SlotInstantiation> {
        let wanted = type_words.join(" ");
        self.slots()
            .filter(|(label, _)| **label == wanted)
            .map(|(l, v)| (l.clone(), v.clone()))
            .collect()
    }

    /// Instantiations matching both the label and the concrete value words.
    pub fn insts_for_typeval(
        &self,
        type_words: &[String],
        value_words: &[String],
    ) -> Vec<SlotInstantiation> {
        let wanted = type_words.join(" ");
        self.slots()
            .filter(|(label, value)| **label == wanted && value.as_slice() == value_words)
            .map(|(l, v)| (l.clone(), v.clone()))
            .collect()
    }
}

/// An utterance confusion network with abstracted alternatives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbstractedConfnet {
    links: Vec<Vec<(f64, AbstractedToken)>>,
}

impl AbstractedConfnet {
    pub fn new(links: Vec<Vec<(f64, AbstractedToken)>>) -> Self {
        Self { links }
    }

    pub fn from_plain(cn: &UtteranceConfnet) -> Self {
        Self {
            links: cn
                .links()
                .iter()
                .map(|alts| {
                    alts.iter()
                        .map(|(p, w)| (*p, AbstractedToken::Word(w.clone())))
                        .collect()
                })
                .collect(),
        }
    }

    fn slots(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.links.iter().flatten().filter_map(|(_, t)| match t {
            AbstractedToken::Slot { label, value } => Some((label, value)),
            AbstractedToken::Word(_) => None,
        })
    }

    pub fn instantiations(&self) -> Vec<SlotInstantiation> {
        self.slots().map(|(l, v)| (l.clone(), v.clone())).collect()
    }

    pub fn all_instantiations(&self, do_abstract: bool) -> Vec<UtteranceConfnet> {
        self.instantiations()
            .into_iter()
            .map(|(label, value)| self.instantiate(&label, &value, do_abstract))
            .collect()
    }

    /// Instantiate the matching slot in every alternative it occurs in.
    /// Multi-word values collapse onto the slot's link position joined by
    /// `_`, keeping link indices aligned.
    pub fn instantiate(
        &self,
        label: &str,
        value: &[String],
        do_abstract: bool,
    ) -> UtteranceConfnet {
        let links = self
            .links
            .iter()
            .map(|alts| {
                alts.iter()
                    .map(|(p, token)| {
                        let word = match token {
                            AbstractedToken::Slot { label: l, value: v }
                                if l == label && v == value =>
                            {
                                if do_abstract {
                                    label.to_string()
                                } else {
                                    value.join("_")
                                }
                            }
                            other => other.abstract_word(),
                        };
                        (*p, word)
                    })
                    .collect()
            })
            .collect();
        UtteranceConfnet::new(links)
    }

    pub fn insts_for_type(&self, type_words: &[String]) -> Vec<SlotInstantiation> {
        let wanted = type_words.join(" ");
        self.slots()
            .filter(|(label, _)| **label == wanted)
            .map(|(l, v)| (l.clone(), v.clone()))
            .collect()
    }

    pub fn insts_for_typeval(
        &self,
        type_words: &[String],
        value_words: &[String],
    ) -> Vec<SlotInstantiation> {
        let wanted = type_words.join(" ");
        self.slots()
            .filter(|(label, value)| **label == wanted && value.as_slice() == value_words)
            .map(|(l, v)| (l.clone(), v.clone()))
            .collect()
    }
}

/// The kind of an input hypothesis, used by extractors to select between
/// token n-grams and lattice-edge n-grams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypKind {
    Utterance,
    Confnet,
}

/// An input hypothesis: a plain utterance or an utterance confusion
/// network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputHyp {
    Utterance(Utterance),
    Confnet(UtteranceConfnet),
}

impl InputHyp {
    pub fn kind(&self) -> HypKind {
        match self {
            Self::Utterance(_) => HypKind::Utterance,
            Self::Confnet(_) => HypKind::Confnet,
        }
    }
}

impl From<Utterance> for InputHyp {
    fn from(utt: Utterance) -> Self {
        Self::Utterance(utt)
    }
}

impl From<UtteranceConfnet> for InputHyp {
    fn from(cn: UtteranceConfnet) -> Self {
        Self::Confnet(cn)
    }
}

/// The abstracted twin of an [`InputHyp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbstractedHyp {
    Utterance(AbstractedUtterance),
    Confnet(AbstractedConfnet),
}

impl AbstractedHyp {
    pub fn kind(&self) -> HypKind {
        match self {
            Self::Utterance(_) => HypKind::Utterance,
            Self::Confnet(_) => HypKind::Confnet,
        }
    }

    pub fn all_instantiations(&self, do_abstract: bool) -> Vec<InputHyp> {
        match self {
            Self::Utterance(ab) => ab
                .all_instantiations(do_abstract)
                .into_iter()
                .map(InputHyp::Utterance)
                .collect(),
            Self::Confnet(ab) => ab
                .all_instantiations(do_abstract)
                .into_iter()
                .map(InputHyp::Confnet)
                .collect(),
        }
    }

    pub fn instantiate(&self, label: &str, value: &[String], do_abstract: bool) -> InputHyp {
        match self {
            Self::Utterance(ab) => InputHyp::Utterance(ab.instantiate(label, value, do_abstract)),
            Self::Confnet(ab) => InputHyp::Confnet(ab.instantiate(label, value, do_abstract)),
        }
    }

    pub fn insts_for_type(&self, type_words: &[String]) -> Vec<SlotInstantiation> {
        match self {
            Self::Utterance(ab) => ab.insts_for_type(type_words),
            Self::Confnet(ab) => ab.insts_for_type(type_words),
        }
    }

    pub fn insts_for_typeval(
        &self,
        type_words: &[String],
        value_words: &[String],
    ) -> Vec<SlotInstantiation> {
        match self {
            Self::Utterance(ab) => ab.insts_for_typeval(type_words, value_words),
            Self::Confnet(ab) => ab.insts_for_typeval(type_words, value_words),
        }
    }
}

/// Category labels identified in an input: label → (normalised value,
/// surface form).
pub type CategoryLabelMap = BTreeMap<String, (String, String)>;

/// Text normalisation and value ↔ category-label substitution, implemented
/// by the surrounding dialogue system.
pub trait Preprocessor {
    fn text_normalisation(&self, utterance: Utterance) -> Utterance;

    /// Abstract a training utterance together with its dialogue act:
    /// returns the abstracted utterance, the DA with items tagged by their
    /// category labels, and the labels found.
    fn values2category_labels_in_da(
        &self,
        utterance: &Utterance,
        da: &DialogueAct,
    ) -> (AbstractedUtterance, DialogueAct, CategoryLabelMap);

    /// Abstract a decode-time utterance without reference labels.
    fn values2category_labels_in_utterance(
        &self,
        utterance: &Utterance,
    ) -> (AbstractedUtterance, CategoryLabelMap);

    fn normalise_confnet(&self, confnet: UtteranceConfnet) -> UtteranceConfnet;

    fn values2category_labels_in_confnet(
        &self,
        confnet: &UtteranceConfnet,
    ) -> (AbstractedConfnet, CategoryLabelMap);

    /// Substitute category labels in a decoded confusion network back for
    /// their original values.
    fn category_labels2values_in_confnet(
        &self,
        confnet: &DaiConfusionNetwork,
        labels: &CategoryLabelMap,
    ) -> DaiConfusionNetwork;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abutt() -> AbstractedUtterance {
        AbstractedUtterance::new(vec![
            AbstractedToken::Word("to".into()),
            AbstractedToken::Slot {
                label: "CITY".into(),
                value: vec!["london".into()],
            },
            AbstractedToken::Word("please".into()),
        ])
    }

    #[test]
    fn instantiate_partial_and_abstract_views() {
        let ab = abutt();
        let partial = ab.instantiate("CITY", &["london".into()], false);
        assert_eq!(partial.to_string(), "to london please");
        let full = ab.instantiate("CITY", &["london".into()], true);
        assert_eq!(full.to_string(), "to CITY please");
    }

    #[test]
    fn insts_for_type_and_typeval() {
        let ab = abutt();
        let insts = ab.insts_for_type(&["CITY".into()]);
        assert_eq!(insts, vec![("CITY".into(), vec!["london".into()])]);
        assert!(ab.insts_for_type(&["FOOD".into()]).is_empty());
        assert_eq!(
            ab.insts_for_typeval(&["CITY".into()], &["london".into()]).len(),
            1
        );
        assert!(ab
            .insts_for_typeval(&["CITY".into()], &["paris".into()])
            .is_empty());
    }

    #[test]
    fn confnet_best_path() {
        let cn = UtteranceConfnet::new(vec![
            vec![(0.9, "hello".into()), (0.1, "yellow".into())],
            vec![(1.0, "there".into())],
        ]);
        assert_eq!(cn.best_utterance().to_string(), "hello there");
    }
}
