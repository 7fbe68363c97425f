//! RESP frame encoding for the backend write path.

use super::RespFrame;
use bytes::{BufMut, BytesMut};

fn put_len(buf: &mut BytesMut, tag: u8, n: i64) {
    buf.put_u8(tag);
    buf.extend_from_slice(n.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// Append the wire encoding of one frame.
pub fn encode_frame(buf: &mut BytesMut, frame: &RespFrame) {
    match frame {
        RespFrame::Simple(s) => {
            buf.put_u8(b'+');
            buf.extend_from_slice(s);
            buf.extend_from_slice(b"\r\n");
        }
        RespFrame::Error(s) => {
            buf.put_u8(b'-');
            buf.extend_from_slice(s);
            buf.extend_from_slice(b"\r\n");
        }
        RespFrame::Integer(n) => put_len(buf, b':', *n),
        RespFrame::Bulk(Some(data)) => {
            put_len(buf, b'$', data.len() as i64);
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }
        RespFrame::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
        RespFrame::Array(Some(elements)) => {
            put_len(buf, b'*', elements.len() as i64);
            for element in elements {
                encode_frame(buf, element);
            }
        }
        RespFrame::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
    }
}

/// Append the wire encoding of a command: the multi-bulk parts wrapped in
/// an array header, without building an intermediate `Array` frame.
pub fn encode_command(buf: &mut BytesMut, multi: &[RespFrame]) {
    put_len(buf, b'*', multi.len() as i64);
    for part in multi {
        encode_frame(buf, part);
    }
}
