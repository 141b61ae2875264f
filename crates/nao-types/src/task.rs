//! Translation task descriptors and the task registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{NaoError, NaoResult};

pub const PAD: &str = "<pad>";
pub const EOS: &str = "</s>";
pub const UNK: &str = "<unk>";

pub const PAD_ID: u32 = 0;
pub const EOS_ID: u32 = 1;
pub const UNK_ID: u32 = 2;

/// Dataset splits. `Dict` is only used for file naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Split {
    Train,
    Dev,
    Test,
    Dict,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
            Split::Dict => "dict",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Average sentence lengths per split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitLengths {
    pub train: f64,
    pub dev: f64,
    pub test: f64,
}

impl SplitLengths {
    fn get(&self, split: Split) -> f64 {
        match split {
            Split::Train | Split::Dict => self.train,
            Split::Dev => self.dev,
            Split::Test => self.test,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LengthInfo {
    pub src: SplitLengths,
    pub trg: SplitLengths,
}

impl Default for LengthInfo {
    fn default() -> Self {
        Self {
            src: SplitLengths { train: 1.0, dev: 2.0, test: 1.0 },
            trg: SplitLengths { train: 1.0, dev: 2.0, test: 1.0 },
        }
    }
}

/// Immutable description of one translation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Unique filename component for data files.
    pub unique_filename: String,
    pub source_lang: String,
    pub target_lang: String,
    pub source_vocab_size: usize,
    pub target_vocab_size: usize,
    pub bpe_symbol: Option<String>,
    pub length_info: LengthInfo,
    /// Extra length bias for decoding long target sentences.
    pub length_bias: f64,
}

impl TaskSpec {
    pub fn new(name: &str, source_lang: &str, target_lang: &str) -> Self {
        Self {
            name: name.to_string(),
            unique_filename: "task".to_string(),
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            source_vocab_size: 0,
            target_vocab_size: 0,
            bpe_symbol: None,
            length_info: LengthInfo::default(),
            length_bias: 4.0,
        }
    }

    pub fn with_unique_filename(mut self, unique: &str) -> Self {
        self.unique_filename = unique.to_string();
        self
    }

    pub fn with_vocab_sizes(mut self, source: usize, target: usize) -> Self {
        self.source_vocab_size = source;
        self.target_vocab_size = target;
        self
    }

    pub fn with_bpe_symbol(mut self, symbol: &str) -> Self {
        self.bpe_symbol = Some(symbol.to_string());
        self
    }

    pub fn with_length_info(mut self, info: LengthInfo) -> Self {
        self.length_info = info;
        self
    }

    pub fn get_lang_pair(&self) -> [&str; 2] {
        [&self.source_lang, &self.target_lang]
    }

    /// `<split>.<unique>.<src>-<trg>.<lang>`, e.g. `train.iwslt.de-en.de`.
    pub fn get_filename(&self, split: Split, is_src_lang: bool) -> String {
        format!(
            "{}.{}.{}-{}.{}",
            split,
            self.unique_filename,
            self.source_lang,
            self.target_lang,
            if is_src_lang { &self.source_lang } else { &self.target_lang }
        )
    }

    pub fn get_avg_length(&self, split: Split, is_src_lang: bool) -> f64 {
        if is_src_lang {
            self.length_info.src.get(split)
        } else {
            self.length_info.trg.get(split)
        }
    }

    /// Factors of `trg_length = a * src_length + b`, fitted on train and dev.
    pub fn get_maxlen_a_b(&self) -> (f64, f64) {
        let (x1, x2) = (self.length_info.src.train, self.length_info.src.dev);
        let (y1, y2) = (self.length_info.trg.train, self.length_info.trg.dev);
        let a = if (x2 - x1).abs() < f64::EPSILON {
            0.0
        } else {
            (y2 - y1) / (x2 - x1)
        };
        let b = y1 - a * x1 + self.length_bias;
        (a, b)
    }

    pub fn get_vocab_size(&self, is_src_lang: bool) -> usize {
        if is_src_lang {
            self.source_vocab_size
        } else {
            self.target_vocab_size
        }
    }
}

/// Maps task names to task descriptors. Built once at process start.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskSpec>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in tasks.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for task in default_tasks() {
            // Built-in names are distinct.
            registry.tasks.insert(task.name.clone(), task);
        }
        registry
    }

    pub fn register(&mut self, task: TaskSpec) -> NaoResult<()> {
        if self.tasks.contains_key(&task.name) {
            return Err(NaoError::Config(format!("Name {} already exists", task.name)));
        }
        self.tasks.insert(task.name.clone(), task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> NaoResult<&TaskSpec> {
        self.tasks
            .get(name)
            .ok_or_else(|| NaoError::Config(format!("Unknown task: {}", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

fn iwslt_bpe_lengths() -> LengthInfo {
    LengthInfo {
        src: SplitLengths {
            train: 19.68445664792664,
            dev: 19.74730951356005,
            test: 20.887703703703703,
        },
        trg: SplitLengths {
            train: 19.674830100570027,
            dev: 19.74931841010188,
            test: 20.657037037037036,
        },
    }
}

/// Built-in tasks.
pub fn default_tasks() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("test", "en", "fr").with_vocab_sizes(10, 10),
        TaskSpec::new("de_en_iwslt", "de", "en")
            .with_unique_filename("iwslt")
            .with_vocab_sizes(32010, 22823)
            .with_length_info(LengthInfo {
                src: SplitLengths {
                    train: 18.5276143642,
                    dev: 18.5530205194,
                    test: 19.6278518519,
                },
                trg: SplitLengths {
                    train: 19.5001891395,
                    dev: 19.5236045344,
                    test: 20.4282962963,
                },
            }),
        TaskSpec::new("de_en_iwslt_bpe", "de", "en")
            .with_unique_filename("iwslt-bpe")
            .with_vocab_sizes(24898, 24898)
            .with_bpe_symbol("@@ ")
            .with_length_info(iwslt_bpe_lengths()),
        TaskSpec::new("de_en_iwslt_bpe2", "de", "en")
            .with_unique_filename("iwslt-bpe2")
            .with_vocab_sizes(31295, 31295)
            .with_bpe_symbol("@@ ")
            .with_length_info(iwslt_bpe_lengths()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_format() {
        let registry = TaskRegistry::with_defaults();
        let task = registry.get("de_en_iwslt").unwrap();
        assert_eq!(task.get_filename(Split::Train, true), "train.iwslt.de-en.de");
        assert_eq!(task.get_filename(Split::Dev, false), "dev.iwslt.de-en.en");
        assert_eq!(task.get_filename(Split::Dict, false), "dict.iwslt.de-en.en");
    }

    #[test]
    fn duplicate_registration_is_config_error() {
        let mut registry = TaskRegistry::with_defaults();
        let err = registry.register(TaskSpec::new("test", "en", "fr")).unwrap_err();
        assert!(matches!(err, NaoError::Config(_)));
        assert!(registry.register(TaskSpec::new("my_task", "en", "ro")).is_ok());
        assert_eq!(registry.names().count(), 5);
    }

    #[test]
    fn unknown_task_is_config_error() {
        let registry = TaskRegistry::with_defaults();
        assert!(matches!(registry.get("nope"), Err(NaoError::Config(_))));
    }

    #[test]
    fn maxlen_a_b_for_default_lengths() {
        let task = TaskSpec::new("t", "en", "fr");
        // src train 1, dev 2; trg train 1, dev 2 -> a = 1, b = 1 - 1 + 4
        let (a, b) = task.get_maxlen_a_b();
        assert!((a - 1.0).abs() < 1e-12);
        assert!((b - 4.0).abs() < 1e-12);
    }

    #[test]
    fn maxlen_handles_identical_source_lengths() {
        let mut task = TaskSpec::new("t", "en", "fr");
        task.length_info.src.dev = task.length_info.src.train;
        let (a, b) = task.get_maxlen_a_b();
        assert_eq!(a, 0.0);
        assert!((b - 5.0).abs() < 1e-12);
    }

    #[test]
    fn vocab_and_lengths() {
        let registry = TaskRegistry::with_defaults();
        let task = registry.get("de_en_iwslt_bpe").unwrap();
        assert_eq!(task.get_vocab_size(true), 24898);
        assert_eq!(task.bpe_symbol.as_deref(), Some("@@ "));
        assert!(task.get_avg_length(Split::Test, false) > 20.0);
        assert_eq!(task.get_lang_pair(), ["de", "en"]);
    }
}
