//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;

/// Customized error type for ackgrid setup, config, and codec failures.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AckgridError(pub(crate) String);

impl AckgridError {
    pub fn msg(msg: impl ToString) -> Self {
        AckgridError(msg.to_string())
    }
}

impl fmt::Display for AckgridError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for AckgridError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `AckgridError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for AckgridError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                AckgridError(e.to_string())
            }
        }
    };
}

// Same as above, for generic error types.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for AckgridError {
            fn from(e: $error) -> AckgridError {
                AckgridError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(crate::collect::WriteError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
