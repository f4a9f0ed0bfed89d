//! Drover control-plane protocol
//!
//! This crate defines the wire format spoken between the proxy and the agents that
//! front managed backend servers: the encrypted frame codec and the closed vocabulary
//! of lifecycle messages carried inside each frame.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlKey, FrameCodec};
pub use messages::{ControlMessage, UnknownMessage};

/// Size of the random initialization vector prefixed to every frame
pub const IV_SIZE: usize = 16;

/// Byte terminating status-query response frames
///
/// Command frames carry no terminator; the receiver reads until the peer closes.
pub const RESPONSE_DELIMITER: u8 = b'\n';

/// Key lengths accepted by the frame cipher (AES-128, AES-192, AES-256)
pub const SUPPORTED_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// Largest notification body the listener accepts; real frames are a few dozen bytes
pub const MAX_FRAME_LEN: usize = 1024;
