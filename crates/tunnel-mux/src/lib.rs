//! Mutual-TLS transport and the stream multiplexer built on top of it
//! (§4.4, §4.5). Stream handlers are responsible for calling
//! [`StreamTable::deregister`] once a stream's close/end frame has been
//! processed — the multiplexer only removes an entry when registering it
//! again would otherwise collide.

mod multiplexer;
mod tables;
mod transport;

pub use multiplexer::{spawn, FrameSender, InboundHandler, MultiplexerError};
pub use tables::{RouteOutcome, StreamReceiver, StreamTable};
pub use transport::{
    accept, build_client_config, build_server_config, connect, peer_certificate_der,
    ClientTlsStream, ServerTlsStream, TransportError,
};
