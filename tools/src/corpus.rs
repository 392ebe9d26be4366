//! JSON-lines training corpus: one `{"utterance": ..., "da": ...}` record
//! per line, with optional `prev_da`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use libslu_core::{DialogueAct, TrainingData, Utterance};

#[derive(Debug, Deserialize)]
struct Record {
    utterance: String,
    da: String,
    #[serde(default)]
    prev_da: Option<String>,
}

/// Read a corpus file into the classifier's training inputs. Records are
/// keyed by their line number.
pub fn load(path: &Path) -> Result<TrainingData> {
    let file = File::open(path).with_context(|| format!("open corpus {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut utterances = BTreeMap::new();
    let mut das = BTreeMap::new();
    let mut prev_das = BTreeMap::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .with_context(|| format!("corpus line {}", line_no + 1))?;
        let id = format!("{:08}", line_no + 1);
        let utterance: Utterance = record.utterance.parse().expect("infallible");
        let da: DialogueAct = record
            .da
            .parse()
            .map_err(|err| anyhow::anyhow!("corpus line {}: {err}", line_no + 1))?;
        if let Some(prev) = record.prev_da {
            let prev: DialogueAct = prev
                .parse()
                .map_err(|err| anyhow::anyhow!("corpus line {}: {err}", line_no + 1))?;
            prev_das.insert(id.clone(), prev);
        }
        utterances.insert(id.clone(), utterance);
        das.insert(id, da);
    }

    Ok(TrainingData {
        utterances: Some(utterances),
        das,
        prev_das: if prev_das.is_empty() {
            None
        } else {
            Some(prev_das)
        },
        ..Default::default()
    })
}
