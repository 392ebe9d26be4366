//! Dialogue acts, dialogue-act items and the DA confusion network.
//!
//! A dialogue act (DA) is an unordered set of dialogue-act items (DAIs);
//! each DAI is an `(act_type, slot, value)` triple where slot and value may
//! be absent. Decoding produces a confusion network of `(probability, DAI)`
//! pairs with configurable merge semantics for duplicate items.
//!
//! The textual form is `act(slot="value")` with items joined by `&`, e.g.
//! `confirm(drinks="wine")&inform(name="kings shilling")`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single dialogue-act item.
///
/// Equality, ordering and hashing consider only the `(act_type, slot,
/// value)` triple. The remaining fields are annotations: `is_generic` marks
/// a value that is a category-label placeholder (e.g. `CITY`) rather than a
/// concrete string, `category_label` records which label a concrete value
/// realises, and `orig_values` collects unnormalised surface forms observed
/// in training data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogueActItem {
    pub act_type: String,
    pub slot: Option<String>,
    pub value: Option<String>,
    pub is_generic: bool,
    pub category_label: Option<String>,
    pub orig_values: BTreeSet<String>,
}

impl DialogueActItem {
    /// Sentinel value meaning "not among known values".
    pub const OTHER_VAL: &'static str = "[OTHER]";

    pub fn new(act_type: impl Into<String>) -> Self {
        Self {
            act_type: act_type.into(),
            ..Default::default()
        }
    }

    pub fn with_slot_value(
        act_type: impl Into<String>,
        slot: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            act_type: act_type.into(),
            slot: Some(slot.into()),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// A generic DAI whose value is the given category label.
    pub fn generic(
        act_type: impl Into<String>,
        slot: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            act_type: act_type.into(),
            slot: Some(slot.into()),
            value: Some(label.into()),
            is_generic: true,
            ..Default::default()
        }
    }

    /// The `other()` act used for out-of-grammar hypotheses.
    pub fn other() -> Self {
        Self::new("other")
    }

    /// True for the null act, the complement of all other dialogue acts.
    pub fn is_null(&self) -> bool {
        self.act_type.is_empty() || self.act_type == "null"
    }

    /// True when the value stands for a category label rather than a
    /// concrete surface string.
    pub fn is_category_label(&self) -> bool {
        self.is_generic
    }

    /// Tag this item as a realisation of the given category label, keeping
    /// the concrete value. The previous value is remembered among
    /// `orig_values`.
    pub fn value_to_category_label(&mut self, label: impl Into<String>) {
        if let Some(val) = &self.value {
            self.orig_values.insert(val.clone());
        }
        self.category_label = Some(label.into());
    }

    /// Record an unnormalised surface form for this item's value.
    pub fn add_orig_value(&mut self, orig: impl Into<String>) {
        self.orig_values.insert(orig.into());
    }

    /// The generic twin of this item: value replaced by its category label.
    /// Items without a known label are returned unchanged.
    pub fn get_generic(&self) -> Self {
        if self.is_generic {
            return self.clone();
        }
        match &self.category_label {
            Some(label) => Self {
                act_type: self.act_type.clone(),
                slot: self.slot.clone(),
                value: Some(label.clone()),
                is_generic: true,
                category_label: None,
                orig_values: BTreeSet::new(),
            },
            None => self.clone(),
        }
    }

    /// Words of the category label governing this item's instantiations:
    /// the recorded label if tagged, otherwise the value itself (which for
    /// a generic item is the label).
    pub fn category_label_words(&self) -> Vec<String> {
        let label = self
            .category_label
            .as_deref()
            .or(self.value.as_deref())
            .unwrap_or("");
        label.split_whitespace().map(str::to_string).collect()
    }
}

impl PartialEq for DialogueActItem {
    fn eq(&self, other: &Self) -> bool {
        self.act_type == other.act_type && self.slot == other.slot && self.value == other.value
    }
}

impl Eq for DialogueActItem {}

impl PartialOrd for DialogueActItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DialogueActItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.act_type, &self.slot, &self.value).cmp(&(
            &other.act_type,
            &other.slot,
            &other.value,
        ))
    }
}

impl Hash for DialogueActItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.act_type.hash(state);
        self.slot.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for DialogueActItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.slot, &self.value) {
            (Some(slot), Some(value)) => write!(f, "{}({}=\"{}\")", self.act_type, slot, value),
            (Some(slot), None) => write!(f, "{}({})", self.act_type, slot),
            (None, Some(value)) => write!(f, "{}(=\"{}\")", self.act_type, value),
            (None, None) => write!(f, "{}()", self.act_type),
        }
    }
}

impl FromStr for DialogueActItem {
    type Err = String;

    /// Parses `act`, `act()`, `act(slot)` or `act(slot="value")`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (act, rest) = match s.find('(') {
            Some(open) => {
                let close = s
                    .rfind(')')
                    .ok_or_else(|| format!("unbalanced parentheses in DAI: {s:?}"))?;
                (&s[..open], &s[open + 1..close])
            }
            None => (s, ""),
        };
        if act.is_empty() {
            return Err(format!("missing act type in DAI: {s:?}"));
        }
        let mut dai = DialogueActItem::new(act);
        let rest = rest.trim();
        if !rest.is_empty() {
            match rest.split_once('=') {
                Some((slot, value)) => {
                    dai.slot = Some(slot.trim().to_string());
                    dai.value = Some(value.trim().trim_matches('"').to_string());
                }
                None => dai.slot = Some(rest.to_string()),
            }
        }
        Ok(dai)
    }
}

/// An unordered set of dialogue-act items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueAct {
    dais: BTreeSet<DialogueActItem>,
}

impl DialogueAct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dai: DialogueActItem) {
        self.dais.insert(dai);
    }

    /// Membership respects DAI triple equality.
    pub fn contains(&self, dai: &DialogueActItem) -> bool {
        self.dais.contains(dai)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DialogueActItem> {
        self.dais.iter()
    }

    pub fn len(&self) -> usize {
        self.dais.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dais.is_empty()
    }

    /// Replace an item, keeping set semantics. Used by preprocessors that
    /// tag values with category labels.
    pub fn map_items<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&DialogueActItem) -> DialogueActItem,
    {
        let mut out = DialogueAct::new();
        for dai in &self.dais {
            out.insert(f(dai));
        }
        out
    }
}

impl FromIterator<DialogueActItem> for DialogueAct {
    fn from_iter<T: IntoIterator<Item = DialogueActItem>>(iter: T) -> Self {
        Self {
            dais: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for DialogueAct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dais.is_empty() {
            return write!(f, "null()");
        }
        let parts: Vec<String> = self.dais.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", parts.join("&"))
    }
}

impl FromStr for DialogueAct {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut da = DialogueAct::new();
        for part in s.split('&') {
            let part = part.trim();
            if part.is_empty() || part == "null()" {
                continue;
            }
            da.insert(part.parse()?);
        }
        Ok(da)
    }
}

/// How probabilities for the same DAI from different classifiers are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMethod {
    /// Replace any existing entry.
    New,
    /// Keep the greater of the two.
    #[default]
    Max,
    /// Noisy-OR: `1 - (1-p1)(1-p2)`.
    Add,
    /// Arithmetic mean.
    Arit,
    /// Harmonic mean; 0 if either is 0.
    Harm,
}

impl FromStr for CombineMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "max" => Ok(Self::Max),
            "add" => Ok(Self::Add),
            "arit" => Ok(Self::Arit),
            "harm" => Ok(Self::Harm),
            other => Err(format!("unknown probability combination method: {other:?}")),
        }
    }
}

impl CombineMethod {
    fn combine(self, old: f64, new: f64) -> f64 {
        match self {
            Self::New => new,
            Self::Max => old.max(new),
            Self::Add => 1.0 - (1.0 - old) * (1.0 - new),
            Self::Arit => 0.5 * (old + new),
            Self::Harm => {
                if old == 0.0 || new == 0.0 {
                    0.0
                } else {
                    2.0 * old * new / (old + new)
                }
            }
        }
    }
}

/// A confusion network of dialogue-act items: `(probability, DAI)` pairs,
/// deduplicated by a merge strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaiConfusionNetwork {
    items: Vec<(f64, DialogueActItem)>,
}

impl DaiConfusionNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item without any merging.
    pub fn add(&mut self, prob: f64, dai: DialogueActItem) {
        self.items.push((prob, dai));
    }

    /// Add an item, merging with any existing entry for the same DAI.
    pub fn add_merge(&mut self, prob: f64, dai: DialogueActItem, combine: CombineMethod) {
        if let Some((old, _)) = self.items.iter_mut().find(|(_, d)| *d == dai) {
            *old = combine.combine(*old, prob);
        } else {
            self.items.push((prob, dai));
        }
    }

    pub fn contains(&self, dai: &DialogueActItem) -> bool {
        self.items.iter().any(|(_, d)| d == dai)
    }

    pub fn prob(&self, dai: &DialogueActItem) -> Option<f64> {
        self.items.iter().find(|(_, d)| d == dai).map(|(p, _)| *p)
    }

    /// Sort by descending probability, then by item, making the network
    /// deterministic for a given model and input.
    pub fn sort(&mut self) {
        self.items.sort_by(|(pa, da), (pb, db)| {
            pb.partial_cmp(pa).unwrap_or(Ordering::Equal).then(da.cmp(db))
        });
    }

    /// Drop items below the probability threshold.
    pub fn prune(&mut self, min_prob: f64) {
        self.items.retain(|(p, _)| *p >= min_prob);
    }

    pub fn iter(&self) -> impl Iterator<Item = &(f64, DialogueActItem)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Map item values, used when substituting category labels back for
    /// their original values.
    pub fn map_items<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&DialogueActItem) -> DialogueActItem,
    {
        Self {
            items: self.items.iter().map(|(p, d)| (*p, f(d))).collect(),
        }
    }
}

impl fmt::Display for DaiConfusionNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (prob, dai) in &self.items {
            writeln!(f, "{prob:.4} {dai}")?;
        }
        Ok(())
    }
}

/// Merge confusion networks produced for the hypotheses of an n-best list,
/// weighting each child network by its hypothesis probability.
pub fn merge_slu_confnets(confnet_hyps: &[(f64, DaiConfusionNetwork)]) -> DaiConfusionNetwork {
    let mut merged = DaiConfusionNetwork::new();
    for (hyp_prob, confnet) in confnet_hyps {
        for (prob, dai) in confnet.iter() {
            merged.add_merge(hyp_prob * prob, dai.clone(), CombineMethod::Add);
        }
    }
    merged
}

/// Occurrence counts of DAIs over training dialogue acts, keyed in sorted
/// order so training iterates classifiers reproducibly.
pub type DaiCounts = BTreeMap<DialogueActItem, usize>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dai_equality_is_triple_only() {
        let mut a = DialogueActItem::with_slot_value("inform", "food", "chinese");
        let b = DialogueActItem::with_slot_value("inform", "food", "chinese");
        a.add_orig_value("china");
        a.value_to_category_label("FOOD");
        assert_eq!(a, b);
        let c = DialogueActItem::with_slot_value("inform", "food", "indian");
        assert_ne!(a, c);
    }

    #[test]
    fn generic_twin_replaces_value_with_label() {
        let mut dai = DialogueActItem::with_slot_value("inform", "to", "london");
        dai.value_to_category_label("CITY");
        let gen = dai.get_generic();
        assert!(gen.is_generic);
        assert_eq!(gen.value.as_deref(), Some("CITY"));
        assert_ne!(gen, dai);
    }

    #[test]
    fn textual_roundtrip() {
        let da: DialogueAct = "confirm(drinks=\"wine\")&inform(name=\"kings shilling\")"
            .parse()
            .unwrap();
        assert_eq!(da.len(), 2);
        let rendered = da.to_string();
        let back: DialogueAct = rendered.parse().unwrap();
        assert_eq!(da, back);
        let hello: DialogueActItem = "hello()".parse().unwrap();
        assert_eq!(hello, DialogueActItem::new("hello"));
    }

    #[test]
    fn merge_max_is_commutative_and_idempotent() {
        let dai = DialogueActItem::new("hello");
        let mut a = DaiConfusionNetwork::new();
        a.add_merge(0.3, dai.clone(), CombineMethod::Max);
        a.add_merge(0.7, dai.clone(), CombineMethod::Max);
        let mut b = DaiConfusionNetwork::new();
        b.add_merge(0.7, dai.clone(), CombineMethod::Max);
        b.add_merge(0.3, dai.clone(), CombineMethod::Max);
        assert_eq!(a.prob(&dai), b.prob(&dai));
        assert_eq!(a.prob(&dai), Some(0.7));
        a.add_merge(0.7, dai.clone(), CombineMethod::Max);
        assert_eq!(a.prob(&dai), Some(0.7));
    }

    #[test]
    fn merge_add_is_noisy_or_and_bounded() {
        let dai = DialogueActItem::new("hello");
        let mut cn = DaiConfusionNetwork::new();
        cn.add_merge(0.6, dai.clone(), CombineMethod::Add);
        cn.add_merge(0.5, dai.clone(), CombineMethod::Add);
        let p = cn.prob(&dai).unwrap();
        assert!((p - 0.8).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn merge_means_stay_within_bounds() {
        let dai = DialogueActItem::new("hello");
        for method in [CombineMethod::Arit, CombineMethod::Harm] {
            let mut cn = DaiConfusionNetwork::new();
            cn.add_merge(0.2, dai.clone(), method);
            cn.add_merge(0.8, dai.clone(), method);
            let p = cn.prob(&dai).unwrap();
            assert!((0.2..=0.8).contains(&p), "{method:?} out of bounds: {p}");
        }
        let mut cn = DaiConfusionNetwork::new();
        cn.add_merge(0.0, dai.clone(), CombineMethod::Harm);
        cn.add_merge(0.8, dai.clone(), CombineMethod::Harm);
        assert_eq!(cn.prob(&dai), Some(0.0));
    }

    #[test]
    fn sort_is_idempotent() {
        let mut cn = DaiConfusionNetwork::new();
        cn.add(0.2, DialogueActItem::new("bye"));
        cn.add(0.9, DialogueActItem::new("hello"));
        cn.add(0.2, DialogueActItem::new("ack"));
        cn.sort();
        let once: Vec<_> = cn.iter().cloned().collect();
        cn.sort();
        let twice: Vec<_> = cn.iter().cloned().collect();
        assert_eq!(once, twice);
        assert_eq!(once[0].1, DialogueActItem::new("hello"));
    }

    #[test]
    fn weighted_merge_of_child_confnets() {
        let hello = DialogueActItem::new("hello");
        let bye = DialogueActItem::new("bye");
        let mut cn1 = DaiConfusionNetwork::new();
        cn1.add(0.9, hello.clone());
        let mut cn2 = DaiConfusionNetwork::new();
        cn2.add(0.8, bye.clone());
        let merged = merge_slu_confnets(&[(0.6, cn1), (0.4, cn2)]);
        assert!((merged.prob(&hello).unwrap() - 0.54).abs() < 1e-12);
        assert!((merged.prob(&bye).unwrap() - 0.32).abs() < 1e-12);
    }
}
