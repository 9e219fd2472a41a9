mod error;
mod invoker;
mod wire;

pub use error::{InvokerError, InvokerErrorDetails};
pub use invoker::{InvocationOutcome, ModelInvoker};
pub use wire::{ChatCompletionRequest, ChatCompletionResponse, ToolSchema, ToolSchemaFunction, WireMessage};
