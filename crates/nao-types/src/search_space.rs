//! Per-kind hyperparameter candidate lists and net code validation.
//!
//! Layer code layouts:
//!
//! ```text
//! [LSTM, HiddenSize, UseBidirectional, ReversedInput, Preprocessors, Postprocessors]
//! [CNN,  OutChannels, KernelSize, Stride, Preprocessors, Postprocessors]
//! [ATT,  NumHeads, FfnHidden, AttentionDropout, Preprocessors, Postprocessors]
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{ArchError, NaoResult};
use crate::net_code::{LayerCode, LayerKind, NetCode, Side, LAYER_CODE_LEN};

/// Number of hyperparameter slots following the kind slot.
pub const NUM_HPARAM_SLOTS: usize = LAYER_CODE_LEN - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preprocessor {
    None,
    Dropout,
    Norm,
    DropoutNorm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Postprocessor {
    None,
    Dropout,
    Residual,
    DropoutResidual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmSpace {
    pub hidden_sizes: Vec<usize>,
    pub use_bidirectional: Vec<bool>,
    pub reversed_input: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvSpace {
    pub out_channels: Vec<usize>,
    pub kernel_sizes: Vec<usize>,
    pub strides: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionSpace {
    pub num_heads: Vec<usize>,
    pub ffn_hidden: Vec<usize>,
    pub attention_dropout: Vec<f64>,
}

/// A layer code resolved against the candidate lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerSpec {
    Lstm {
        hidden_size: usize,
        bidirectional: bool,
        reversed: bool,
        pre: Preprocessor,
        post: Postprocessor,
    },
    Conv {
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        pre: Preprocessor,
        post: Postprocessor,
    },
    Attention {
        num_heads: usize,
        ffn_hidden: usize,
        attention_dropout: f64,
        pre: Preprocessor,
        post: Postprocessor,
    },
}

impl LayerSpec {
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerSpec::Lstm { .. } => LayerKind::Lstm,
            LayerSpec::Conv { .. } => LayerKind::Convolutional,
            LayerSpec::Attention { .. } => LayerKind::Attention,
        }
    }

    pub fn pre(&self) -> Preprocessor {
        match self {
            LayerSpec::Lstm { pre, .. }
            | LayerSpec::Conv { pre, .. }
            | LayerSpec::Attention { pre, .. } => *pre,
        }
    }

    pub fn post(&self) -> Postprocessor {
        match self {
            LayerSpec::Lstm { post, .. }
            | LayerSpec::Conv { post, .. }
            | LayerSpec::Attention { post, .. } => *post,
        }
    }
}

/// The full layer search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub lstm: LstmSpace,
    pub conv: ConvSpace,
    pub attention: AttentionSpace,
    pub preprocessors: Vec<Preprocessor>,
    pub postprocessors: Vec<Postprocessor>,
}

impl SearchSpace {
    /// The "normal" search space.
    pub fn normal() -> Self {
        Self {
            lstm: LstmSpace {
                hidden_sizes: vec![32, 64, 128, 256],
                use_bidirectional: vec![false, true],
                reversed_input: vec![false, true],
            },
            conv: ConvSpace {
                out_channels: vec![8, 16, 32, 64],
                kernel_sizes: vec![1, 3, 5, 7],
                strides: vec![1, 2, 3],
            },
            attention: AttentionSpace {
                num_heads: vec![2, 4, 8, 16],
                ffn_hidden: vec![64, 128, 256, 512],
                attention_dropout: vec![0.0, 0.1, 0.2],
            },
            preprocessors: vec![
                Preprocessor::None,
                Preprocessor::Dropout,
                Preprocessor::Norm,
                Preprocessor::DropoutNorm,
            ],
            postprocessors: vec![
                Postprocessor::None,
                Postprocessor::Dropout,
                Postprocessor::Residual,
                Postprocessor::DropoutResidual,
            ],
        }
    }

    /// Candidate list sizes for the hyperparameter slots of `kind`.
    pub fn slot_sizes(&self, kind: LayerKind) -> [usize; NUM_HPARAM_SLOTS] {
        let (a, b, c) = match kind {
            LayerKind::Lstm => (
                self.lstm.hidden_sizes.len(),
                self.lstm.use_bidirectional.len(),
                self.lstm.reversed_input.len(),
            ),
            LayerKind::Convolutional => (
                self.conv.out_channels.len(),
                self.conv.kernel_sizes.len(),
                self.conv.strides.len(),
            ),
            LayerKind::Attention => (
                self.attention.num_heads.len(),
                self.attention.ffn_hidden.len(),
                self.attention.attention_dropout.len(),
            ),
        };
        [a, b, c, self.preprocessors.len(), self.postprocessors.len()]
    }

    pub fn slot_names(kind: LayerKind) -> [&'static str; NUM_HPARAM_SLOTS] {
        match kind {
            LayerKind::Lstm => [
                "HiddenSizes",
                "UseBidirectional",
                "ReversedInput",
                "Preprocessors",
                "Postprocessors",
            ],
            LayerKind::Convolutional => [
                "OutChannels",
                "KernelSizes",
                "Strides",
                "Preprocessors",
                "Postprocessors",
            ],
            LayerKind::Attention => [
                "NumHeads",
                "FfnHidden",
                "AttentionDropout",
                "Preprocessors",
                "Postprocessors",
            ],
        }
    }

    /// Widest candidate list per slot, the kind slot first.
    pub fn max_slot_sizes(&self) -> [usize; LAYER_CODE_LEN] {
        let mut widths = [0; LAYER_CODE_LEN];
        widths[0] = LayerKind::ALL.len();
        for kind in LayerKind::ALL {
            for (slot, size) in self.slot_sizes(kind).iter().enumerate() {
                widths[slot + 1] = widths[slot + 1].max(*size);
            }
        }
        widths
    }

    /// Validate one layer code.
    pub fn check_layer(&self, side: Side, layer: usize, code: &[usize]) -> NaoResult<LayerKind> {
        if code.len() != LAYER_CODE_LEN {
            return Err(ArchError::BadLayerLength {
                side: side.to_string(),
                layer,
                expected: LAYER_CODE_LEN,
                actual: code.len(),
            }
            .into());
        }
        let kind = LayerKind::from_code(code[0]).ok_or_else(|| ArchError::UnknownLayerKind {
            side: side.to_string(),
            layer,
            kind: code[0],
        })?;
        let sizes = self.slot_sizes(kind);
        let names = Self::slot_names(kind);
        for (slot, &index) in code[1..].iter().enumerate() {
            if index >= sizes[slot] {
                return Err(ArchError::IndexOutOfRange {
                    side: side.to_string(),
                    layer,
                    field: names[slot].to_string(),
                    index,
                    size: sizes[slot],
                }
                .into());
            }
        }
        Ok(kind)
    }

    /// Validate every layer of a net code.
    pub fn check_correctness(&self, code: &NetCode) -> NaoResult<()> {
        for side in [Side::Encoder, Side::Decoder] {
            for (i, layer) in code.layers(side).iter().enumerate() {
                self.check_layer(side, i, layer)?;
            }
        }
        Ok(())
    }

    /// Resolve a layer code to concrete hyperparameter values.
    pub fn describe_layer(&self, side: Side, layer: usize, code: &[usize]) -> NaoResult<LayerSpec> {
        let kind = self.check_layer(side, layer, code)?;
        let pre = self.preprocessors[code[4]];
        let post = self.postprocessors[code[5]];
        Ok(match kind {
            LayerKind::Lstm => LayerSpec::Lstm {
                hidden_size: self.lstm.hidden_sizes[code[1]],
                bidirectional: self.lstm.use_bidirectional[code[2]],
                reversed: self.lstm.reversed_input[code[3]],
                pre,
                post,
            },
            LayerKind::Convolutional => LayerSpec::Conv {
                out_channels: self.conv.out_channels[code[1]],
                kernel_size: self.conv.kernel_sizes[code[2]],
                stride: self.conv.strides[code[3]],
                pre,
                post,
            },
            LayerKind::Attention => LayerSpec::Attention {
                num_heads: self.attention.num_heads[code[1]],
                ffn_hidden: self.attention.ffn_hidden[code[2]],
                attention_dropout: self.attention.attention_dropout[code[3]],
                pre,
                post,
            },
        })
    }

    /// Sample a uniformly random valid layer code.
    pub fn sample_layer<R: Rng + ?Sized>(&self, rng: &mut R) -> LayerCode {
        let kind = LayerKind::ALL[rng.gen_range(0..LayerKind::ALL.len())];
        let mut code = Vec::with_capacity(LAYER_CODE_LEN);
        code.push(kind.code());
        for size in self.slot_sizes(kind) {
            code.push(rng.gen_range(0..size));
        }
        code
    }

    /// Sample a uniformly random valid net code.
    pub fn sample_net_code<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        num_enc_layers: usize,
        num_dec_layers: usize,
    ) -> NetCode {
        let encoder = (0..num_enc_layers).map(|_| self.sample_layer(rng)).collect();
        let decoder = (0..num_dec_layers).map(|_| self.sample_layer(rng)).collect();
        NetCode::new(encoder, decoder)
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::normal()
    }
}
