//! CAN frame codec: wire format, command codes, stream reassembly

pub mod commands;
mod frame;
mod reader;
mod ring_buffer;

pub use frame::{generate_hash, CanFrame, FRAME_SIZE, MAX_DLC};
pub use reader::FrameReader;
pub use ring_buffer::RingBuffer;
