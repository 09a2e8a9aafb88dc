mod codec;
mod msg;
mod ring;

pub use codec::{FASTBOOT_CHUNK, HEADER_LEN, MAX_PAYLOAD, WireError, encode, encode_into, try_decode};
pub use msg::{Msg, MsgType};
pub use ring::{FillOutcome, RingBuffer};
