//! Request processing for the event loop.
//!
//! A request is whatever a single receive returned; the responder turns it
//! into the bytes written back before the connection closes.

use bytes::Bytes;

/// The literal reply, including its NUL terminator (19 bytes).
pub const GREETING: &[u8] = b"Hello from server!\0";

/// Produces the response for one request.
pub trait Responder {
    fn respond(&mut self, request: &[u8]) -> Bytes;
}

/// Replies with `GREETING` regardless of the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greeting;

impl Responder for Greeting {
    fn respond(&mut self, _request: &[u8]) -> Bytes {
        Bytes::from_static(GREETING)
    }
}

impl<F> Responder for F
where
    F: FnMut(&[u8]) -> Bytes,
{
    fn respond(&mut self, request: &[u8]) -> Bytes {
        self(request)
    }
}

/// Printable prefix of a request for logging.
pub fn preview(request: &[u8]) -> String {
    const PREVIEW_LEN: usize = 64;
    let end = request.len().min(PREVIEW_LEN);
    String::from_utf8_lossy(&request[..end]).into_owned()
}
