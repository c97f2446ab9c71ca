pub mod error;
pub mod event;
pub mod listener;
pub mod session;

pub use error::{ErrorClass, SessionError};
pub use event::{ConnectRequest, Event, RequestToken};
pub use listener::{CallbackListener, Listener, ListenerRegistry, PeerData};
pub use session::{Role, Session};
