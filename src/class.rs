//! The on-disk class-file format: raw structures, the reader, and an
//! assembler producing well-formed class bytes.

mod builder;
mod mutf8;
mod parser;
mod structs;

pub use builder::{ClassBuilder, CodeBuilder, Label};
pub use mutf8::{decode_modified_utf8, encode_modified_utf8};
pub use parser::class_file;
pub use structs::*;
