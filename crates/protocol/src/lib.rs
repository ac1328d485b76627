//! Wire protocol for dropwire file transfers.
//!
//! Everything travels over a single ordered data channel as one of two
//! frame shapes:
//!
//! ```text
//! CONTROL: {"type":"metadata"|"complete"|"ack"|"nack"|"error", ...}   (JSON)
//! CHUNK:   {"type":"chunk","index":i,"totalChunks":n} 0x0A <raw payload>
//! ```
//!
//! A frame containing a `0x0A` byte is a chunk frame. The JSON encoder never
//! emits a raw newline, so control frames never contain one.

pub mod error;
pub mod frame;
pub mod metadata;

pub use error::ProtocolError;
pub use frame::{ChunkHeader, ControlFrame, ErrorScope, FRAME_DELIMITER, Frame, encode_chunk};
pub use metadata::{DEFAULT_CONTENT_TYPE, FileMetadata, sanitize_file_name};
