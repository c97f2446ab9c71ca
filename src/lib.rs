//! A minimal reliable-UDP session layer. A process plays one role, server or client: the
//!  [session::Session] state machine creates the host, drives the asynchronous connect
//!  handshake, pumps transport events and dispatches them to an application
//!  [session::Listener]. [endpoint::ClientEndpoint] and [endpoint::ServerEndpoint] wrap the
//!  typical lifecycle.

pub mod config;
pub mod endpoint;
pub mod packet;
pub mod session;
pub mod test_util;
pub mod transport;


#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
