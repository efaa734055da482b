//! Protocol module - connection options and value framing.
//!
//! This module implements what travels on the wire around the codec:
//! - the one-line JSON [`Options`] record that opens every connection
//! - 4-byte length-prefixed frames used by the binary codec

pub mod frame;
mod options;

pub use frame::{
    encode_frame_into, read_frame, skip_frame, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE,
};
pub use options::{Options, MAGIC_NUMBER, MAX_OPTIONS_LEN};
