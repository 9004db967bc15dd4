// Wire helpers for handshake framing and decode-error logging.
pub(crate) use self::decode_log::log_decode_error;
pub(crate) use self::frame_io::{read_server_op, write_flush};

mod decode_log;
mod frame_io;
