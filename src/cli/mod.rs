pub mod build;
pub mod user;

use crate::api::{ApiError, ApiResultExt};

pub const BUILD_NOT_FOUND: &str = "This build does not exist or you cannot access it.";
pub const APP_NOT_FOUND: &str = "This application does not exist or you cannot access it.";

/// Report recoverable API errors and missing builds, mapping both to `None`
pub fn handled<T>(result: Result<T, ApiError>) -> anyhow::Result<Option<T>> {
    handled_with(result, BUILD_NOT_FOUND)
}

/// Like [`handled`], printing `not_found` when the resource is missing
pub fn handled_with<T>(result: Result<T, ApiError>, not_found: &str) -> anyhow::Result<Option<T>> {
    match result.recover() {
        Ok(value) => Ok(value),
        Err(ApiError::NotFound) => {
            println!("{}", not_found);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Notice shown before commands when no token is stored
pub fn print_not_logged_in() {
    println!("You are not logged in. To use Odevio you need a user account.");
    println!();
    println!("  $ odevio signin --help   for instructions to log in your account.");
    println!();
    println!("=============================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_resources_become_none() {
        let missing: Result<u32, ApiError> = Err(ApiError::NotFound);
        assert_eq!(handled_with(missing, APP_NOT_FOUND).unwrap(), None);
        assert_eq!(handled(Err::<u32, _>(ApiError::NotFound)).unwrap(), None);
        assert_eq!(handled_with(Ok(7), APP_NOT_FOUND).unwrap(), Some(7));
    }

    #[test]
    fn test_fatal_errors_propagate() {
        let broken: Result<u32, ApiError> = Err(ApiError::ServerUnavailable);
        assert!(handled_with(broken, APP_NOT_FOUND).is_err());
    }
}
