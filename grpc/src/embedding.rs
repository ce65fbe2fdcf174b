tonic::include_proto!("embedding");

use anyhow::Result;
use prost::{Message, Name};
use prost_types::Any;

impl TensorShapeProto {
    pub fn new() -> Self {
        Self { dim: Vec::new() }
    }

    pub fn with_dims(dims: &[i64]) -> Self {
        Self { dim: dims.to_vec() }
    }
}

impl TensorProto {
    pub fn new() -> Self {
        Self {
            dtype: DataType::DtInvalid.into(),
            tensor_shape: Some(TensorShapeProto::new()),
            float_val: Vec::new(),
            uint64_val: Vec::new(),
        }
    }

    /// Construct an one dim `u64` tensor, used for feature ids.
    pub fn with_u64_vec(values: Vec<u64>) -> Self {
        Self {
            dtype: DataType::DtUint64.into(),
            tensor_shape: Some(TensorShapeProto::with_dims(&[values.len() as i64])),
            float_val: Vec::new(),
            uint64_val: values,
        }
    }

    /// Construct a `f32` tensor with shape `[rows, dim]`, used for embedding values and grads.
    pub fn with_f32_vec(values: Vec<f32>, dim: usize) -> Self {
        let rows = if dim == 0 { 0 } else { values.len() / dim };

        Self {
            dtype: DataType::DtFloat.into(),
            tensor_shape: Some(TensorShapeProto::with_dims(&[rows as i64, dim as i64])),
            float_val: values,
            uint64_val: Vec::new(),
        }
    }

    /// Last dim of the shape, 0 if the shape is missing.
    pub fn last_dim(&self) -> usize {
        self.tensor_shape
            .as_ref()
            .and_then(|x| x.dim.last().copied())
            .map(|x| x.max(0) as usize)
            .unwrap_or(0)
    }
}

impl TensorMessage {
    pub fn new() -> Self {
        Self {
            role: Role::Trainer.into(),
            role_id: 0,
            seq_id: 0,
            varname: String::new(),
            options: None,
            tensor1: Some(TensorProto::new()),
            tensor2: Some(TensorProto::new()),
        }
    }

    /// Construct `TensorMessage` with options packed into `Any`.
    pub fn with_option<M: Message + Name>(
        role: Role,
        role_id: u32,
        varname: &str,
        option: &M,
    ) -> Result<Self> {
        let options = Any::from_msg(option)?;

        Ok(Self {
            role: role.into(),
            role_id,
            seq_id: 0,
            varname: varname.to_string(),
            options: Some(options),
            tensor1: Some(TensorProto::new()),
            tensor2: Some(TensorProto::new()),
        })
    }

    /// Ids carried by `tensor1`.
    pub fn ids(&self) -> &[u64] {
        match self.tensor1.as_ref() {
            Some(x) => x.uint64_val.as_slice(),
            None => &[],
        }
    }

    /// Float values carried by `tensor2`.
    pub fn values(&self) -> &[f32] {
        match self.tensor2.as_ref() {
            Some(x) => x.float_val.as_slice(),
            None => &[],
        }
    }
}
