//! Marshaling streams for the ice encoding.

mod input;
mod output;
mod traits;

pub use input::InputStream;
pub use output::OutputStream;
pub use traits::{Marshal, Unmarshal};
