//! Streaming I/O over a child's standard streams.
//!
//! - [`OutputStream`]: pull-based reader producing immutable [`Buffer`]s
//! - [`InputWriter`]: feeds bytes, chunk lists or async sources into stdin

mod buffer;
mod input;
mod output;

pub use buffer::Buffer;
pub use input::{Input, InputWriter};
pub use output::OutputStream;
