// End-to-end scenarios: train a small model, decode, round-trip through
// the model store, and parse n-best lists.

use std::collections::BTreeMap;

use libslu_core::{
    AbstractedConfnet, AbstractedToken, AbstractedUtterance, CategoryLabelMap, CombineMethod,
    Config, DaiClassifier, DaiConfusionNetwork, DialogueAct, DialogueActItem, ParseInput,
    Preprocessor, TrainOpts, TrainingData, Utterance, UtteranceConfnet,
};

fn utt(s: &str) -> Utterance {
    s.parse().unwrap()
}

fn da(s: &str) -> DialogueAct {
    s.parse().unwrap()
}

fn greetings_data() -> TrainingData {
    let utterances: BTreeMap<String, Utterance> = [
        ("u1".to_string(), utt("hello")),
        ("u2".to_string(), utt("hello")),
        ("u3".to_string(), utt("goodbye")),
    ]
    .into_iter()
    .collect();
    let das: BTreeMap<String, DialogueAct> = [
        ("u1".to_string(), da("hello()")),
        ("u2".to_string(), da("hello()")),
        ("u3".to_string(), da("bye()")),
    ]
    .into_iter()
    .collect();
    TrainingData {
        utterances: Some(utterances),
        das,
        ..Default::default()
    }
}

fn train_greetings() -> DaiClassifier {
    let config = Config::default();
    let mut clser = DaiClassifier::new(&config, None);
    clser.extract_features(greetings_data()).expect("extract");
    clser.prune_features(Some(1), Some(1)).expect("prune features");
    clser.prune_classifiers(
        1,
        None,
        None,
        None::<fn(&DialogueActItem, usize) -> bool>,
    );
    clser
        .train(&TrainOpts {
            sparsification: 4.0,
            ..Default::default()
        })
        .expect("train");
    clser
}

fn parse(clser: &DaiClassifier, text: &str) -> DaiConfusionNetwork {
    let utterance = utt(text);
    clser
        .parse_1_best(
            ParseInput {
                utterance: Some(&utterance),
                ..Default::default()
            },
            CombineMethod::default(),
        )
        .expect("parse")
}

#[test]
fn trained_model_separates_greetings() {
    let clser = train_greetings();
    let confnet = parse(&clser, "hello");

    let hello = DialogueActItem::new("hello");
    let bye = DialogueActItem::new("bye");
    let p_hello = confnet.prob(&hello).expect("hello() in confnet");
    let p_bye = confnet.prob(&bye).expect("bye() in confnet");
    assert!(p_hello > 0.5, "hello() scored {p_hello}");
    assert!(p_bye < 0.5, "bye() scored {p_bye}");

    // Thresholds were calibrated and stay within the probability range.
    let threshold = clser.threshold(&hello);
    assert!((0.0..=1.0).contains(&threshold));
}

#[test]
fn gz_save_load_roundtrip_decodes_identically() {
    let mut clser = train_greetings();
    let before = parse(&clser, "hello");

    let mut path = std::env::temp_dir();
    path.push(format!("libslu_e2e_{}.slu.gz", std::process::id()));
    clser.save_model(&path, true, None).expect("save");

    // Reduction must not change decode outputs.
    let reduced = parse(&clser, "hello");
    assert_eq!(before, reduced);

    let mut loaded = DaiClassifier::new(&Config::default(), None);
    loaded.load_model(&path).expect("load");
    let after = parse(&loaded, "hello");
    assert_eq!(before, after);

    std::fs::remove_file(&path).ok();
}

#[test]
fn nblist_parse_merges_hypotheses() {
    let clser = train_greetings();
    let nblist = vec![(0.6, utt("hello")), (0.4, utt("goodbye"))];
    let confnet = clser.parse_nblist(&nblist).expect("parse nblist");

    let hello = DialogueActItem::new("hello");
    let bye = DialogueActItem::new("bye");
    let p_hello = confnet.prob(&hello).expect("hello() in confnet");
    let p_bye = confnet.prob(&bye).expect("bye() in confnet");
    assert!(p_hello >= p_bye, "hello {p_hello} < bye {p_bye}");
}

#[test]
fn empty_nblist_yields_empty_confnet() {
    let clser = train_greetings();
    let confnet = clser.parse_nblist(&[]).expect("parse");
    assert!(confnet.is_empty());
}

#[test]
fn other_hypothesis_short_circuits() {
    let clser = train_greetings();
    let confnet = clser
        .parse_nblist(&[(1.0, utt("__other__"))])
        .expect("parse");
    assert_eq!(confnet.len(), 1);
    assert_eq!(confnet.prob(&DialogueActItem::other()), Some(1.0));
}

#[test]
fn parse_output_is_sorted_by_probability() {
    let clser = train_greetings();
    let confnet = parse(&clser, "hello");
    let probs: Vec<f64> = confnet.iter().map(|(p, _)| *p).collect();
    let mut sorted = probs.clone();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    assert_eq!(probs, sorted);
}

#[test]
fn da_nblist_backoff_inserts_unclassified_items_sorted() {
    let clser = train_greetings();
    // restart() has no classifier; the n-best back-off must carry it into
    // the output at its original probability, and the returned network
    // must still be sorted.
    let restart = DialogueActItem::new("restart");
    let nbl_da: DialogueAct = [restart.clone()].into_iter().collect();
    let da_nblist = vec![(0.7, nbl_da)];

    let utterance = utt("hello");
    let confnet = clser
        .parse_1_best(
            ParseInput {
                utterance: Some(&utterance),
                da_nblist: Some(&da_nblist),
                ..Default::default()
            },
            CombineMethod::default(),
        )
        .expect("parse");

    assert_eq!(confnet.prob(&restart), Some(0.7));
    assert!(confnet.contains(&DialogueActItem::new("hello")));
    let probs: Vec<f64> = confnet.iter().map(|(p, _)| *p).collect();
    let mut sorted = probs.clone();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    assert_eq!(probs, sorted);
}

#[test]
fn single_class_dai_is_skipped_and_absent_from_output() {
    // ack() appears in every training DA, so it has no negative rows.
    let utterances: BTreeMap<String, Utterance> = [
        ("u1".to_string(), utt("hello")),
        ("u2".to_string(), utt("hello")),
        ("u3".to_string(), utt("goodbye")),
    ]
    .into_iter()
    .collect();
    let das: BTreeMap<String, DialogueAct> = [
        ("u1".to_string(), da("hello()&ack()")),
        ("u2".to_string(), da("hello()&ack()")),
        ("u3".to_string(), da("bye()&ack()")),
    ]
    .into_iter()
    .collect();

    let mut clser = DaiClassifier::new(&Config::default(), None);
    clser
        .extract_features(TrainingData {
            utterances: Some(utterances),
            das,
            ..Default::default()
        })
        .expect("extract");
    clser.prune_features(Some(1), Some(1)).expect("prune features");
    clser.prune_classifiers(
        1,
        None,
        None,
        None::<fn(&DialogueActItem, usize) -> bool>,
    );
    let report = clser
        .train(&TrainOpts {
            sparsification: 4.0,
            ..Default::default()
        })
        .expect("train");

    let ack = DialogueActItem::new("ack");
    assert!(report.skipped.iter().any(|(dai, _)| *dai == ack));
    assert!(report.fitted.iter().all(|dai| *dai != ack));

    let confnet = parse(&clser, "hello");
    assert!(!confnet.contains(&ack));
    assert!(confnet.contains(&DialogueActItem::new("hello")));
}

#[test]
fn untrained_dai_is_absent_from_output() {
    let clser = train_greetings();
    let confnet = parse(&clser, "hello");
    assert!(!confnet.contains(&DialogueActItem::new("restart")));
}

// ========== Abstraction via a stub preprocessor ==========

/// Treats a fixed list of city names as realisations of the CITY label.
struct CityPreprocessor;

const CITIES: [&str; 2] = ["london", "paris"];

impl CityPreprocessor {
    fn abstract_utterance(utterance: &Utterance) -> (AbstractedUtterance, CategoryLabelMap) {
        let mut labels = CategoryLabelMap::new();
        let tokens = utterance
            .words()
            .iter()
            .map(|word| {
                if CITIES.contains(&word.as_str()) {
                    labels.insert("CITY".to_string(), (word.clone(), word.clone()));
                    AbstractedToken::Slot {
                        label: "CITY".to_string(),
                        value: vec![word.clone()],
                    }
                } else {
                    AbstractedToken::Word(word.clone())
                }
            })
            .collect();
        (AbstractedUtterance::new(tokens), labels)
    }
}

impl Preprocessor for CityPreprocessor {
    fn text_normalisation(&self, utterance: Utterance) -> Utterance {
        utterance
    }

    fn values2category_labels_in_da(
        &self,
        utterance: &Utterance,
        da: &DialogueAct,
    ) -> (AbstractedUtterance, DialogueAct, CategoryLabelMap) {
        let (abutt, labels) = Self::abstract_utterance(utterance);
        let norm_da = da.map_items(|dai| {
            let mut dai = dai.clone();
            if dai.value.as_deref().is_some_and(|v| CITIES.contains(&v)) {
                dai.value_to_category_label("CITY");
            }
            dai
        });
        (abutt, norm_da, labels)
    }

    fn values2category_labels_in_utterance(
        &self,
        utterance: &Utterance,
    ) -> (AbstractedUtterance, CategoryLabelMap) {
        Self::abstract_utterance(utterance)
    }

    fn normalise_confnet(&self, confnet: UtteranceConfnet) -> UtteranceConfnet {
        confnet
    }

    fn values2category_labels_in_confnet(
        &self,
        confnet: &UtteranceConfnet,
    ) -> (AbstractedConfnet, CategoryLabelMap) {
        (AbstractedConfnet::from_plain(confnet), CategoryLabelMap::new())
    }

    fn category_labels2values_in_confnet(
        &self,
        confnet: &DaiConfusionNetwork,
        _labels: &CategoryLabelMap,
    ) -> DaiConfusionNetwork {
        confnet.map_items(|dai| dai.clone())
    }
}

fn cities_data() -> TrainingData {
    let utterances: BTreeMap<String, Utterance> = [
        ("u1".to_string(), utt("to london please")),
        ("u2".to_string(), utt("to paris please")),
        ("u3".to_string(), utt("hello there")),
    ]
    .into_iter()
    .collect();
    let das: BTreeMap<String, DialogueAct> = [
        ("u1".to_string(), da("inform(to=\"london\")")),
        ("u2".to_string(), da("inform(to=\"paris\")")),
        ("u3".to_string(), da("hello()")),
    ]
    .into_iter()
    .collect();
    TrainingData {
        utterances: Some(utterances),
        das,
        ..Default::default()
    }
}

#[test]
fn generic_classifier_decodes_unseen_instantiations() {
    let config = Config::default();
    let mut clser = DaiClassifier::new(&config, Some(Box::new(CityPreprocessor)));
    clser.extract_features(cities_data()).expect("extract");
    clser.prune_features(Some(1), Some(1)).expect("prune features");
    clser.prune_classifiers(
        1,
        None,
        None,
        None::<fn(&DialogueActItem, usize) -> bool>,
    );
    clser
        .train(&TrainOpts {
            sparsification: 4.0,
            ..Default::default()
        })
        .expect("train");

    // The generic inform(to=CITY) classifier exists.
    let generic = DialogueActItem::generic("inform", "to", "CITY");
    assert!(clser.trained_dais().iter().any(|d| **d == generic));

    let confnet = parse(&clser, "to london please");
    let inst = DialogueActItem::with_slot_value("inform", "to", "london");
    let p_inst = confnet.prob(&inst).expect("instantiated DAI in confnet");
    assert!(p_inst > 0.5, "inform(to=london) scored {p_inst}");

    let p_hello = confnet.prob(&DialogueActItem::new("hello")).unwrap_or(0.0);
    assert!(p_hello < 0.5, "hello() scored {p_hello}");

    // A generic classifier is silent on inputs with no anchor: the bare
    // category label never reaches the output.
    let confnet = parse(&clser, "hello there");
    assert!(confnet
        .iter()
        .all(|(_, dai)| dai.value.as_deref() != Some("CITY")));
}

#[test]
fn confnet_parse_matches_trained_acts() {
    let clser = train_greetings();
    let confnet = UtteranceConfnet::new(vec![vec![
        (0.9, "hello".to_string()),
        (0.1, "goodbye".to_string()),
    ]]);
    let decoded = clser
        .parse_confnet(&confnet, true, CombineMethod::default())
        .expect("parse confnet");
    assert!(decoded.contains(&DialogueActItem::new("hello")));
    assert!(decoded.contains(&DialogueActItem::new("bye")));
}
