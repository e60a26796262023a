pub mod autograd;
pub mod error;
pub mod module;
pub mod nn;
pub mod profiler;
pub mod tensor;
pub mod train;

// Re-export commonly used types
pub use autograd::{Tape, Var};
pub use error::{Error, Result};
pub use module::{invoke, named_parameters, HookSet, Module};
pub use nn::{PeleeNet, PeleeNetConfig};
pub use profiler::{scoped_profiling, Profiler, ProfilerOptions, ProfilerScope, ProfileReport};
pub use tensor::{DataType, Parameter, Tensor, TensorDescriptor};
pub use train::{run, TrainConfig};
