//! Local HTTP proxy listener: dispatches `CONNECT`, WebSocket upgrades, and
//! plain HTTP requests onto the tunnel (§4.7).

pub mod connect;
pub mod http;
pub mod server;
pub mod websocket;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use std::convert::Infallible;

pub(crate) type ResponseBody = BoxBody<Bytes, Infallible>;

pub(crate) fn empty_body() -> ResponseBody {
    http_body_util::Empty::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
