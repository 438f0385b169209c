//! IoT testbed core: token codec, protocol kinds, log sinks, readings.
//! No sockets here; `iot-node` owns the transport.

pub mod logger;
pub mod protocol;
pub mod reading;
pub mod reading_log;
pub mod timestamp;
pub mod wire;

pub use logger::{BufferedLog, FileLog, LogSink, LogSinks, TracingSink};
pub use protocol::Message;
pub use reading::{FixedReading, ReadingKind, ReadingSource, SineReading};
pub use reading_log::{CsvReadingLog, ReadingLog};
pub use wire::{
    decode, decode_frame, encode, encode_frame, FrameDecodeError, FrameEncodeError, SEPARATOR,
};
