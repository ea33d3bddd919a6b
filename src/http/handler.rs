//! The application callback.

use crate::http::parser::Request;
use crate::http::response::ResponseChannel;
use crate::net::error::ServeError;

/// What the handler receives: a parsed request with its response channel,
/// or the reason a connection failed.
pub type HandlerInput = Result<(Request, ResponseChannel), ServeError>;

/// Receives every request and every per-connection error.
///
/// Called on the connection's task; long work should be spawned so the
/// session can keep reading once the response is sent.
pub trait RequestHandler: Send + Sync + 'static {
    fn on_request(&self, input: HandlerInput);
}

impl<F> RequestHandler for F
where
    F: Fn(HandlerInput) + Send + Sync + 'static,
{
    fn on_request(&self, input: HandlerInput) {
        self(input)
    }
}
