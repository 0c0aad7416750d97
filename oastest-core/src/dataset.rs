//! Fuzz value datasets and their consumption bookkeeping.
//!
//! A dataset maps primitive type names to positive (should pass) and
//! negative (should 400) value pools. Values already consumed in earlier
//! runs are tracked in a done-data file so successive runs walk fresh
//! values; once the pool is exhausted the bookkeeping resets and the
//! cycle restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::values::value_key;

/// Consumption bookkeeping file, kept inside the data directory.
pub const DONE_DATA_FILE: &str = "mqdata.yml";
/// Unique-key declarations file.
pub const UNIQUE_KEYS_FILE: &str = "uniqueKeys.yml";

/// Which fuzz sample kinds a run generates.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuzzMode {
    #[default]
    None,
    Positive,
    Datatype,
    Negative,
    All,
}

impl FuzzMode {
    pub fn positive(self) -> bool {
        matches!(self, FuzzMode::Positive | FuzzMode::All)
    }

    pub fn datatype(self) -> bool {
        matches!(self, FuzzMode::Datatype | FuzzMode::All)
    }

    pub fn negative(self) -> bool {
        matches!(self, FuzzMode::Negative | FuzzMode::All)
    }
}

impl FromStr for FuzzMode {
    type Err = Error;

    fn from_str(text: &str) -> Result<FuzzMode> {
        match text {
            "none" => Ok(FuzzMode::None),
            "positive" => Ok(FuzzMode::Positive),
            "datatype" => Ok(FuzzMode::Datatype),
            "negative" => Ok(FuzzMode::Negative),
            "all" => Ok(FuzzMode::All),
            other => Err(Error::not_found(format!("unknown fuzz mode: {other}"))),
        }
    }
}

impl fmt::Display for FuzzMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FuzzMode::None => "none",
            FuzzMode::Positive => "positive",
            FuzzMode::Datatype => "datatype",
            FuzzMode::Negative => "negative",
            FuzzMode::All => "all",
        };
        f.write_str(label)
    }
}

type ValuePool = BTreeMap<String, Vec<JsonValue>>;

/// Positive and negative value pools per primitive type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub positive: ValuePool,
    #[serde(default)]
    pub negative: ValuePool,
}

/// The bundled string pool used when no dataset file is supplied.
pub fn naughty_strings() -> Vec<JsonValue> {
    include_str!("../data/naughty_strings.txt")
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| JsonValue::String(line.to_string()))
        .collect()
}

impl Dataset {
    /// Loads the dataset for a run: the full pool comes from
    /// `dataset_path` (or the bundled naughty strings), already-consumed
    /// values recorded in the done-data file are skipped, and at most
    /// `batch` fresh values per type are selected. Returns the selected
    /// dataset and the updated done-data to write back after the run.
    pub fn load(
        dataset_path: Option<&Path>,
        data_dir: &Path,
        mode: FuzzMode,
        batch: usize,
    ) -> Result<(Dataset, Dataset)> {
        let all = match dataset_path {
            Some(path) => {
                let text = fs::read_to_string(path)?;
                serde_yaml::from_str(&text)?
            }
            None => {
                let mut all = Dataset::default();
                if mode.positive() {
                    all.positive.insert("string".to_string(), naughty_strings());
                }
                if mode.negative() {
                    all.negative.insert("string".to_string(), naughty_strings());
                }
                all
            }
        };

        let done_path = data_dir.join(DONE_DATA_FILE);
        let mut done: Dataset = if done_path.exists() {
            serde_yaml::from_str(&fs::read_to_string(&done_path)?)?
        } else {
            Dataset::default()
        };

        let mut selected = Dataset::default();
        if mode.positive() {
            filter_pool(&mut done.positive, &all.positive, &mut selected.positive, batch);
        }
        if mode.negative() {
            filter_pool(&mut done.negative, &all.negative, &mut selected.negative, batch);
        }
        Ok((selected, done))
    }

    /// Writes the consumption bookkeeping back to the data directory.
    pub fn write_done(data_dir: &Path, done: &Dataset) -> Result<()> {
        let text = serde_yaml::to_string(done)?;
        fs::write(data_dir.join(DONE_DATA_FILE), text)?;
        Ok(())
    }
}

/// Picks up to `batch` per-type values from `all` that are not recorded
/// in `done`, appending picks to both `out` and `done`. When every value
/// has been consumed, `done` resets and the selection restarts from the
/// top of the pool.
fn filter_pool(done: &mut ValuePool, all: &ValuePool, out: &mut ValuePool, batch: usize) {
    for _round in 0..2 {
        let mut picked_any = false;
        for (type_name, values) in all {
            let consumed: BTreeSet<String> = done
                .get(type_name)
                .into_iter()
                .flatten()
                .map(value_key)
                .collect();
            for value in values {
                if consumed.contains(&value_key(value)) {
                    continue;
                }
                let selected = out.entry(type_name.clone()).or_default();
                if selected.len() >= batch {
                    break;
                }
                selected.push(value.clone());
                done.entry(type_name.clone()).or_default().push(value.clone());
                picked_any = true;
            }
        }
        if picked_any {
            return;
        }
        // Every value was consumed in earlier runs; restart the cycle.
        done.clear();
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UniqueKeysFile {
    #[serde(default, rename = "uniqueKeys")]
    unique_keys: Vec<String>,
}

/// Reads the unique-key declarations; a missing file means no unique keys.
pub fn read_unique_keys(data_dir: &Path) -> Result<BTreeSet<String>> {
    let path = data_dir.join(UNIQUE_KEYS_FILE);
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let parsed: UniqueKeysFile = serde_yaml::from_str(&fs::read_to_string(&path)?)?;
    Ok(parsed.unique_keys.into_iter().collect())
}
