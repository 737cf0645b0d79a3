//! Small error-handling helpers shared across modules.

/// Log-and-discard for errors that must not stop the caller, such as
/// join results during shutdown.
pub trait ResultOkLogExt<T, E> {
    fn ok_log(self) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_log_passes_values_through_and_swallows_errors() {
        let ok: Result<u32, std::io::Error> = Ok(7);
        assert_eq!(ok.ok_log(), Some(7));

        let err: Result<u32, std::io::Error> =
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(err.ok_log(), None);
    }
}
