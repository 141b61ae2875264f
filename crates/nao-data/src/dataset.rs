//! Language-pair datasets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nao_types::{DataError, NaoResult, Split, TaskSpec};
use tracing::info;

use crate::dictionary::Dictionary;
use crate::tokenizer::Tokenizer;

/// Token-indexed sentence pairs of one split.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguagePairDataset {
    pub split: Split,
    src: Vec<Vec<u32>>,
    trg: Vec<Vec<u32>>,
}

impl LanguagePairDataset {
    pub fn new(split: Split, src: Vec<Vec<u32>>, trg: Vec<Vec<u32>>) -> NaoResult<Self> {
        if src.len() != trg.len() {
            return Err(DataError::MisalignedSplit {
                split: split.to_string(),
                source_len: src.len(),
                target_len: trg.len(),
            }
            .into());
        }
        Ok(Self { split, src, trg })
    }

    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    pub fn source(&self, index: usize) -> &[u32] {
        &self.src[index]
    }

    pub fn target(&self, index: usize) -> &[u32] {
        &self.trg[index]
    }

    pub fn src_len(&self, index: usize) -> usize {
        self.src[index].len()
    }

    /// Number of tokens a sample contributes to a batch.
    pub fn num_tokens(&self, index: usize) -> usize {
        self.src[index].len().max(self.trg[index].len())
    }
}

/// Where the raw held-out reference sentences come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceSource {
    File(PathBuf),
    InMemory(Vec<String>),
}

/// Dictionaries plus the loaded splits of one task.
#[derive(Debug, Clone)]
pub struct LanguageDatasets {
    pub task: TaskSpec,
    pub source_dict: Dictionary,
    pub target_dict: Dictionary,
    splits: BTreeMap<Split, Arc<LanguagePairDataset>>,
    references: ReferenceSource,
}

impl LanguageDatasets {
    /// Load dictionaries and splits from `data_dir` using the task's file names.
    pub fn load<P: AsRef<Path>>(data_dir: P, task: &TaskSpec, splits: &[Split]) -> NaoResult<Self> {
        let data_dir = data_dir.as_ref();
        info!("Loading datasets for task {} from {}", task.name, data_dir.display());

        let source_dict = Dictionary::load(data_dir.join(task.get_filename(Split::Dict, true)))?;
        let target_dict = Dictionary::load(data_dir.join(task.get_filename(Split::Dict, false)))?;

        let mut loaded = BTreeMap::new();
        for &split in splits {
            let src = read_split(&data_dir.join(task.get_filename(split, true)), &source_dict)?;
            let trg = read_split(&data_dir.join(task.get_filename(split, false)), &target_dict)?;
            let dataset = LanguagePairDataset::new(split, src, trg)?;
            info!("Split {}: {} sentence pairs", split, dataset.len());
            loaded.insert(split, Arc::new(dataset));
        }

        let references = ReferenceSource::File(
            data_dir.join(format!("{}.orig", task.get_filename(Split::Dev, false))),
        );

        Ok(Self {
            task: task.clone(),
            source_dict,
            target_dict,
            splits: loaded,
            references,
        })
    }

    pub fn from_parts(
        task: TaskSpec,
        source_dict: Dictionary,
        target_dict: Dictionary,
        splits: Vec<LanguagePairDataset>,
        references: ReferenceSource,
    ) -> Self {
        Self {
            task,
            source_dict,
            target_dict,
            splits: splits.into_iter().map(|d| (d.split, Arc::new(d))).collect(),
            references,
        }
    }

    /// Build datasets from raw sentence pairs, growing the dictionaries as
    /// needed. Dev targets double as the references.
    pub fn from_raw_pairs(task: TaskSpec, splits: &[(Split, Vec<(&str, &str)>)]) -> NaoResult<Self> {
        let mut source_dict = Dictionary::new();
        let mut target_dict = Dictionary::new();
        let mut datasets = Vec::new();
        let mut references = Vec::new();

        for (split, pairs) in splits {
            let mut src = Vec::with_capacity(pairs.len());
            let mut trg = Vec::with_capacity(pairs.len());
            for (s, t) in pairs {
                src.push(Tokenizer::tokenize_adding(s, &mut source_dict));
                trg.push(Tokenizer::tokenize_adding(t, &mut target_dict));
                if *split == Split::Dev {
                    references.push(t.to_string());
                }
            }
            datasets.push(LanguagePairDataset::new(*split, src, trg)?);
        }

        Ok(Self::from_parts(
            task,
            source_dict,
            target_dict,
            datasets,
            ReferenceSource::InMemory(references),
        ))
    }

    /// Shared handle to a loaded split.
    pub fn split(&self, split: Split) -> NaoResult<Arc<LanguagePairDataset>> {
        self.splits.get(&split).cloned().ok_or_else(|| {
            DataError::SplitNotLoaded {
                split: split.to_string(),
            }
            .into()
        })
    }

    pub fn has_split(&self, split: Split) -> bool {
        self.splits.contains_key(&split)
    }

    pub fn references(&self) -> &ReferenceSource {
        &self.references
    }

    /// Raw (untokenized) held-out reference sentences.
    pub fn read_references(&self) -> NaoResult<Vec<String>> {
        match &self.references {
            ReferenceSource::InMemory(lines) => Ok(lines.clone()),
            ReferenceSource::File(path) => {
                if !path.exists() {
                    return Err(DataError::MissingReferences {
                        message: format!("{} does not exist", path.display()),
                    }
                    .into());
                }
                let text = std::fs::read_to_string(path)?;
                Ok(text.lines().map(str::to_string).collect())
            }
        }
    }
}

fn read_split(path: &Path, dict: &Dictionary) -> NaoResult<Vec<Vec<u32>>> {
    if !path.exists() {
        return Err(DataError::FileNotFound {
            path: path.display().to_string(),
        }
        .into());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().map(|line| Tokenizer::tokenize(line, dict)).collect())
}
