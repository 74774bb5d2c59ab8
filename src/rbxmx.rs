pub mod reader;
pub mod writer;

pub use reader::{read_document, ReadError};
pub use writer::{write_document, ReferentStyle};
