//! The pluggable inference module contract and its tensor vocabulary.

use crate::error::Result;

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TensorType {
    #[default]
    Float32,
    Int32,
    UInt8,
    Int64,
    String,
    Bool,
    Int16,
    Complex64,
    Int8,
    Float16,
    Float64,
    UInt64,
    UInt32,
    UInt16,
}

/// Shape and typing metadata for one tensor slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TensorInfo {
    pub data_type: TensorType,
    pub size: usize,
    pub name: Option<String>,
    pub dims: Vec<i32>,
}

/// One tensor: typed bytes, laid out per the matching [`TensorInfo`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tensor {
    pub data_type: TensorType,
    pub data: Vec<u8>,
}

/// One key/value configuration item for a runtime backend. The key space
/// is backend-defined; the core passes entries through untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    pub kind: u8,
    pub value: String,
}

/// A blocking inference backend.
///
/// Implementations are free to block in every method; the async adapter
/// confines them to a dedicated worker thread so callers on an event loop
/// never wait on them directly. Methods are invoked strictly in the order
/// the adapter receives commands.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait InferenceRuntime: Send {
    fn configure(&mut self, config: RuntimeConfig) -> Result<()>;

    fn load_model(&mut self, path: &str) -> Result<()>;

    fn input_tensor_info(&self) -> Result<Vec<TensorInfo>>;

    fn output_tensor_info(&self) -> Result<Vec<TensorInfo>>;

    fn set_input_tensor_info(&mut self, info: Vec<TensorInfo>) -> Result<()>;

    fn set_output_tensor_info(&mut self, info: Vec<TensorInfo>) -> Result<()>;

    /// Produces input buffers sized per the current input tensor info.
    fn allocate_tensors(&mut self) -> Result<Vec<Tensor>>;

    /// Releases buffers produced by [`allocate_tensors`](Self::allocate_tensors).
    /// Dropping is the default; backends with arena-owned buffers override.
    fn free_tensors(&mut self, tensors: Vec<Tensor>) -> Result<()> {
        drop(tensors);
        Ok(())
    }

    /// Final pre-inference setup (graph compilation, device binding).
    fn prepare(&mut self) -> Result<()>;

    /// Runs one inference over `inputs`. Outputs are retrieved separately
    /// through [`get_output`](Self::get_output).
    fn invoke(&mut self, inputs: &[Tensor]) -> Result<()>;

    /// Collects the outputs of the most recent [`invoke`](Self::invoke).
    fn get_output(&mut self) -> Result<Vec<Tensor>>;

    fn stop(&mut self) -> Result<()>;
}
