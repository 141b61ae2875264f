//! Architecture descriptors ("net codes").
//!
//! Standard format is a nested list: `[[encoder layers...], [decoder layers...]]`
//! where every layer is a list of small integers. The first integer selects the
//! layer kind, the rest index the per-kind candidate lists of a
//! [`SearchSpace`](crate::search_space::SearchSpace).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::errors::{ArchError, NaoError, NaoResult};

/// Length of every layer code: `[KIND, H1, H2, H3, PRE, POST]`.
pub const LAYER_CODE_LEN: usize = 6;

/// Layer kinds selectable by the first integer of a layer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Lstm,
    Convolutional,
    Attention,
}

impl LayerKind {
    pub const ALL: [LayerKind; 3] = [
        LayerKind::Lstm,
        LayerKind::Convolutional,
        LayerKind::Attention,
    ];

    pub fn from_code(code: usize) -> Option<Self> {
        Self::ALL.get(code).copied()
    }

    pub fn code(self) -> usize {
        match self {
            LayerKind::Lstm => 0,
            LayerKind::Convolutional => 1,
            LayerKind::Attention => 2,
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerKind::Lstm => write!(f, "lstm"),
            LayerKind::Convolutional => write!(f, "conv"),
            LayerKind::Attention => write!(f, "attention"),
        }
    }
}

/// Which half of the network a layer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Encoder,
    Decoder,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Encoder => write!(f, "encoder"),
            Side::Decoder => write!(f, "decoder"),
        }
    }
}

/// One layer code.
pub type LayerCode = Vec<usize>;

type RawNetCode = (Vec<LayerCode>, Vec<LayerCode>);

/// Immutable architecture descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawNetCode", into = "RawNetCode")]
pub struct NetCode {
    encoder: Vec<LayerCode>,
    decoder: Vec<LayerCode>,
}

impl From<RawNetCode> for NetCode {
    fn from((encoder, decoder): RawNetCode) -> Self {
        Self { encoder, decoder }
    }
}

impl From<NetCode> for RawNetCode {
    fn from(code: NetCode) -> Self {
        (code.encoder, code.decoder)
    }
}

impl NetCode {
    pub fn new(encoder: Vec<LayerCode>, decoder: Vec<LayerCode>) -> Self {
        Self { encoder, decoder }
    }

    pub fn encoder(&self) -> &[LayerCode] {
        &self.encoder
    }

    pub fn decoder(&self) -> &[LayerCode] {
        &self.decoder
    }

    pub fn layers(&self, side: Side) -> &[LayerCode] {
        match side {
            Side::Encoder => &self.encoder,
            Side::Decoder => &self.decoder,
        }
    }

    /// Total number of layers on both sides.
    pub fn num_layers(&self) -> usize {
        self.encoder.len() + self.decoder.len()
    }

    /// Parse the JSON nested-list format, ignoring `//` line comments.
    pub fn from_json_str(text: &str) -> NaoResult<Self> {
        let comment = Regex::new(r"//[^\n]*").map_err(|e| ArchError::Parse {
            message: e.to_string(),
        })?;
        let stripped = comment.replace_all(text, "");
        serde_json::from_str(&stripped).map_err(|e| {
            ArchError::Parse {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Load a net code file. Only `.json` is supported.
    pub fn from_file<P: AsRef<Path>>(path: P) -> NaoResult<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "json" => {
                let text = std::fs::read_to_string(path)?;
                Self::from_json_str(&text)
            }
            other => Err(NaoError::Config(format!(
                "Unsupported net code file format '.{}' for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn to_json(&self) -> NaoResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for NetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enc={:?} dec={:?}", self.encoder, self.decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fairseq_like() -> NetCode {
        NetCode::new(
            vec![vec![1, 2, 1, 0, 1, 0]; 4],
            vec![vec![1, 2, 1, 0, 1, 0]; 3],
        )
    }

    #[test]
    fn serializes_as_nested_lists() {
        let code = NetCode::new(vec![vec![0, 1, 0, 0, 0, 0]], vec![vec![2, 0, 1, 2, 3, 1]]);
        let json = code.to_json().unwrap();
        assert_eq!(json, "[[[0,1,0,0,0,0]],[[2,0,1,2,3,1]]]");
    }

    #[test]
    fn parses_json_with_line_comments() {
        let text = r#"
            [   // Network
                [   // Encoder
                    [1, 2, 1, 0, 1, 0], // layer 0
                    [1, 2, 1, 0, 1, 0]
                ],
                [   // Decoder
                    [2, 0, 0, 0, 0, 0]
                ]
            ]
        "#;
        let code = NetCode::from_json_str(text).unwrap();
        assert_eq!(code.encoder().len(), 2);
        assert_eq!(code.decoder(), &[vec![2, 0, 0, 0, 0, 0]]);
    }

    #[test]
    fn loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fairseq_d.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{}", fairseq_like().to_json().unwrap()).unwrap();

        let code = NetCode::from_file(&path).unwrap();
        assert_eq!(code, fairseq_like());
        assert_eq!(code.num_layers(), 7);
    }

    #[test]
    fn rejects_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("code.pkl");
        std::fs::write(&path, b"binary").unwrap();

        match NetCode::from_file(&path) {
            Err(NaoError::Config(msg)) => assert!(msg.contains(".pkl")),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn layer_kind_codes() {
        for kind in LayerKind::ALL {
            assert_eq!(LayerKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(LayerKind::from_code(3), None);
    }
}
