//! On-disk wire formats: tagged value encoding and the tuple record format.
//!
//! Everything here is little-endian. These formats are byte-for-byte
//! contracts with the files on disk, so they are hand-rolled rather than
//! routed through serde.

pub mod tuple;
pub mod value;

pub use tuple::{TUPLE_DELETED_OFFSET, decode_tuple, encode_tuple};
pub use value::{decode_value, encode_value};
