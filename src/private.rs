//! Decrypting private messages.
//!
//! Decryption itself is done by an [`Unboxer`] provided by the application.

use std::fmt::Debug;

use nested_enum_utils::common_fields;
use serde_json::Value;
use snafu::{Backtrace, Snafu};

use crate::message::Message;

/// The result of unboxing a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Unboxed {
    /// The decrypted content.
    Cleartext(Value),
    /// The message is not encrypted, its content can be used as is.
    NotBoxed,
}

/// Errors when unboxing a message.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub))]
pub enum UnboxError {
    /// None of our keys opens the message.
    #[snafu(display("message is not for us"))]
    NotForUs {},
    #[snafu(display("malformed ciphertext: {reason}"))]
    Malformed { reason: String },
}

/// Decrypts the content of private messages.
pub trait Unboxer: Send + Sync + Debug + 'static {
    /// Decrypts the content of `message`.
    fn unbox(&self, message: &Message) -> Result<Unboxed, UnboxError>;
}
