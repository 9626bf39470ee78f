//! Wire formats. The datagram codec produces the binary frames used over UDP, the stream codec
//!  the CRLF terminated text lines used over TCP. Both are pure functions over [crate::message::Message].

pub mod datagram;
pub mod stream;
