//! Premise corpus: an `N x D` embedding matrix plus one record per row.
//!
//! On disk the matrix is a safetensors file holding a single tensor named
//! `embeddings` (F32, or F64 narrowed on load) and the records are a JSON
//! object keyed by row index:
//!
//! ```json
//! { "0": { "full_name": "Nat.add_comm", "path": "Mathlib/Algebra/Group/Basic.lean", "code": "..." } }
//! ```

use ndarray::Array2;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::{ProverError, Result};

/// Name of the tensor holding the embedding matrix.
pub const EMBEDDINGS_TENSOR: &str = "embeddings";

/// Metadata for one premise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PremiseRecord {
    /// Fully qualified name.
    #[serde(rename = "full_name")]
    pub name: String,
    /// Source file the premise is declared in.
    pub path: String,
    /// Declaration source text.
    #[serde(rename = "code")]
    pub source_text: String,
}

impl PremiseRecord {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        source_text: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            source_text: source_text.into(),
        }
    }
}

/// Immutable once built; shared by reference across concurrent retrievals.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    embeddings: Array2<f32>,
    records: Vec<PremiseRecord>,
}

impl EmbeddingStore {
    /// Row `i` of `embeddings` belongs to `records[i]`.
    pub fn new(embeddings: Array2<f32>, records: Vec<PremiseRecord>) -> Result<Self> {
        if embeddings.nrows() == 0 || embeddings.ncols() == 0 {
            return Err(ProverError::invalid(format!(
                "embedding matrix must be non-empty, got {:?}",
                embeddings.dim()
            )));
        }
        if records.len() != embeddings.nrows() {
            return Err(ProverError::invalid(format!(
                "{} records for {} embedding rows",
                records.len(),
                embeddings.nrows()
            )));
        }
        Ok(Self {
            embeddings,
            records,
        })
    }

    /// Builds a store from records keyed by row index. Every row needs exactly one record.
    pub fn from_indexed(
        embeddings: Array2<f32>,
        mut indexed: HashMap<usize, PremiseRecord>,
    ) -> Result<Self> {
        let rows = embeddings.nrows();
        if let Some(&extra) = indexed.keys().find(|&&i| i >= rows) {
            return Err(ProverError::invalid(format!(
                "record {} has no embedding row ({} rows)",
                extra, rows
            )));
        }
        let mut records = Vec::with_capacity(rows);
        for i in 0..rows {
            let record = indexed
                .remove(&i)
                .ok_or_else(|| ProverError::invalid(format!("embedding row {} has no record", i)))?;
            records.push(record);
        }
        Self::new(embeddings, records)
    }

    pub fn load(embeddings_path: impl AsRef<Path>, dictionary_path: impl AsRef<Path>) -> Result<Self> {
        let embeddings_path = embeddings_path.as_ref();
        let dictionary_path = dictionary_path.as_ref();
        for path in [embeddings_path, dictionary_path] {
            if !path.exists() {
                return Err(ProverError::NotFound {
                    path: path.to_path_buf(),
                });
            }
        }

        let data = fs::read(embeddings_path)?;
        let embeddings = read_embeddings(&data)?;

        let text = fs::read_to_string(dictionary_path)?;
        let raw: HashMap<String, PremiseRecord> = serde_json::from_str(&text)?;
        let mut indexed = HashMap::with_capacity(raw.len());
        for (key, record) in raw {
            let index = key.parse::<usize>().map_err(|e| ProverError::Serialization {
                message: format!("premise key `{}` is not an index: {}", key, e),
            })?;
            indexed.insert(index, record);
        }

        let store = Self::from_indexed(embeddings, indexed)?;
        tracing::info!(
            premises = store.len(),
            dim = store.dim(),
            path = %embeddings_path.display(),
            "loaded premise embeddings"
        );
        Ok(store)
    }

    /// Writes the two files `load` reads.
    pub fn save(&self, embeddings_path: impl AsRef<Path>, dictionary_path: impl AsRef<Path>) -> Result<()> {
        let bytes: Vec<u8> = self
            .embeddings
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::F32, vec![self.len(), self.dim()], &bytes)?;
        let serialized = safetensors::serialize([(EMBEDDINGS_TENSOR, view)], &None)?;
        fs::write(embeddings_path, serialized)?;

        let dictionary: BTreeMap<String, &PremiseRecord> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (i.to_string(), r))
            .collect();
        fs::write(dictionary_path, serde_json::to_string_pretty(&dictionary)?)?;
        Ok(())
    }

    /// Number of premises (N).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Embedding dimension (D).
    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn embeddings(&self) -> &Array2<f32> {
        &self.embeddings
    }

    pub fn records(&self) -> &[PremiseRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Result<&PremiseRecord> {
        self.records.get(index).ok_or(ProverError::IndexOutOfRange {
            index,
            len: self.records.len(),
        })
    }
}

fn read_embeddings(data: &[u8]) -> Result<Array2<f32>> {
    let tensors = SafeTensors::deserialize(data)?;
    let view = tensors.tensor(EMBEDDINGS_TENSOR)?;
    let shape = view.shape().to_vec();
    if shape.len() != 2 {
        return Err(ProverError::Serialization {
            message: format!("expected a 2-D `{}` tensor, got shape {:?}", EMBEDDINGS_TENSOR, shape),
        });
    }

    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F64 => view
            .data()
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect(),
        other => {
            return Err(ProverError::Serialization {
                message: format!("unsupported embedding dtype {:?}", other),
            })
        }
    };

    Array2::from_shape_vec((shape[0], shape[1]), values).map_err(|e| ProverError::Serialization {
        message: format!("shape error: {}", e),
    })
}
