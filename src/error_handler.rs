use crate::Error;

/// Hook receiving background failures: refresh errors and realtime stream errors.
///
/// These errors never reach the evaluation path. Plug a handler in to report them to your
/// monitoring system.
pub trait ErrorHandler {
    fn handle_error(&self, error: &Error);
}

/// Default handler. Failures are already logged with `warn` level, so nothing else is done.
pub(crate) struct NoopErrorHandler;
impl ErrorHandler for NoopErrorHandler {
    fn handle_error(&self, _error: &Error) {}
}

impl<T: Fn(&Error)> ErrorHandler for T {
    fn handle_error(&self, error: &Error) {
        self(error);
    }
}
