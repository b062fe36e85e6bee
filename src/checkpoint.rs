// checkpoint.rs
// ============================================================================
// Note:     Named weight store of the decoder. Every parameter is a 2-D
//           tensor keyed by a dotted name ("layers.0.attn.w_qkv"). The file
//           is one bincode record: model config plus the tensor map.
//           Missing or mis-shaped tensors are fatal on load.
// ============================================================================

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bincode::{config, decode_from_std_read, encode_into_std_write, Decode, Encode};
use ndarray::Array2;

use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl StoredTensor {
    pub fn from_matrix(m: &Array2<f32>) -> Self {
        Self {
            shape: vec![m.nrows(), m.ncols()],
            data: m.iter().copied().collect(),
        }
    }
}

#[derive(Clone, Debug, Encode, Decode)]
pub struct Checkpoint {
    #[bincode(with_serde)]
    pub config: ModelConfig,
    pub tensors: BTreeMap<String, StoredTensor>,
}

impl Checkpoint {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            tensors: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, s_name: &str, m: &Array2<f32>) {
        self.tensors
            .insert(s_name.to_string(), StoredTensor::from_matrix(m));
    }

    /// Removes a required tensor and checks its shape.
    pub fn take(&mut self, s_name: &str, t_shape: (usize, usize)) -> EngineResult<Array2<f32>> {
        self.take_optional(s_name, t_shape)?
            .ok_or_else(|| EngineError::MissingWeight(s_name.to_string()))
    }

    pub fn take_optional(
        &mut self,
        s_name: &str,
        t_shape: (usize, usize),
    ) -> EngineResult<Option<Array2<f32>>> {
        let Some(tensor) = self.tensors.remove(s_name) else {
            return Ok(None);
        };
        let v_expected = vec![t_shape.0, t_shape.1];
        if tensor.shape != v_expected || tensor.data.len() != t_shape.0 * t_shape.1 {
            return Err(EngineError::ShapeMismatch {
                name: s_name.to_string(),
                expected: v_expected,
                found: tensor.shape,
            });
        }
        Ok(Some(Array2::from_shape_vec(t_shape, tensor.data)?))
    }

    pub fn save<P: AsRef<Path>>(&self, p_path: P) -> EngineResult<()> {
        let f = File::create(p_path.as_ref())?;
        let mut w = BufWriter::with_capacity(8 * 1024 * 1024, f);
        encode_into_std_write(self, &mut w, config::standard())?;
        w.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(p_path: P) -> EngineResult<Self> {
        let f = File::open(p_path.as_ref())?;
        let mut r = BufReader::with_capacity(8 * 1024 * 1024, f);
        Ok(decode_from_std_read(&mut r, config::standard())?)
    }
}
