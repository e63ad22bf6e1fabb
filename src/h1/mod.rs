//! http/1.1 wire protocol: head decode, body transfer coding, head encode
//! and the per-connection dispatch loop.

pub(crate) mod codec;
pub(crate) mod conn;
pub(crate) mod decode;
pub(crate) mod encode;
