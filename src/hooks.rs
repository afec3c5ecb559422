use crate::error::BoxError;
use crate::request::Request;
use crate::response::Response;

/// Runs after a call produced a response, in registration order.
///
/// The first hook that fails turns the whole call into
/// [`Error::AfterExecute`](crate::Error::AfterExecute); later hooks do not run.
pub trait AfterExecute: Send + Sync {
    fn after_execute(&self, request: &Request, response: &Response) -> Result<(), BoxError>;
}

impl<F> AfterExecute for F
where
    F: Fn(&Request, &Response) -> Result<(), BoxError> + Send + Sync,
{
    fn after_execute(&self, request: &Request, response: &Response) -> Result<(), BoxError> {
        self(request, response)
    }
}
