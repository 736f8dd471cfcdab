//! Image transport layer.

pub mod mock;
pub mod stream;
pub mod traits;

pub use mock::ScriptedSource;
pub use stream::{FileSource, SliceSource, StreamSource};
pub use traits::{DataRequest, Delivery, ImageSource, TransportError};
