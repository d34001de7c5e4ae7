//! Marshalling of errors and panics into a transferable form.
//!
//! A background failure never crosses the channel as a live error value.
//! It is reduced to a triple of strings (type name, message, formatted
//! backtrace) so that it can be logged, displayed, and shipped across a
//! process boundary without the receiving side knowing the concrete type.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;

/// An error reduced to strings for safe cross-boundary transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarshalledException {
    /// Name of the error type, best effort.
    pub exception_type: String,
    /// The error's display message, including its source chain.
    pub message: String,
    /// A formatted backtrace captured at the marshalling site.
    pub traceback: String,
}

impl MarshalledException {
    /// Marshals a typed error, capturing its concrete type name and the
    /// full source chain.
    #[must_use]
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self {
            exception_type: std::any::type_name::<E>().to_owned(),
            message: render_chain(error),
            traceback: Backtrace::force_capture().to_string(),
        }
    }

    /// Marshals a type-erased error.
    ///
    /// The concrete type name is no longer recoverable here, so the debug
    /// representation's leading token stands in for it.
    #[must_use]
    pub fn from_dyn(error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            exception_type: debug_type_hint(error),
            message: render_chain(error),
            traceback: Backtrace::force_capture().to_string(),
        }
    }

    /// Marshals a panic payload as produced by `catch_unwind`.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self {
            exception_type: "panic".to_owned(),
            message,
            traceback: Backtrace::force_capture().to_string(),
        }
    }

    /// Marshals an internal machinery failure. Reserved for coding errors
    /// in the task plumbing itself, not user task failures.
    #[must_use]
    pub(crate) fn machinery(message: &str) -> Self {
        Self {
            exception_type: "internal error".to_owned(),
            message: message.to_owned(),
            traceback: Backtrace::force_capture().to_string(),
        }
    }
}

impl fmt::Display for MarshalledException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)
    }
}

/// Renders an error and its sources as a single line.
fn render_chain(error: &(dyn std::error::Error + '_)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Extracts a type hint from a debug representation.
///
/// For derived `Debug` impls the representation starts with the type name,
/// followed by `(`, `{` or whitespace for non-unit shapes.
fn debug_type_hint(error: &dyn fmt::Debug) -> String {
    let rendered = format!("{error:?}");
    let end = rendered
        .find(|c: char| c == '(' || c == '{' || c.is_whitespace())
        .unwrap_or(rendered.len());
    rendered[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("denominator was zero")]
    struct ZeroDivisionError;

    #[derive(Debug, Error)]
    #[error("config rejected")]
    struct Outer(#[source] ZeroDivisionError);

    #[test]
    fn typed_marshalling_captures_type_name() {
        let marshalled = MarshalledException::from_error(&ZeroDivisionError);
        assert!(marshalled.exception_type.contains("ZeroDivisionError"));
        assert_eq!(marshalled.message, "denominator was zero");
        assert!(!marshalled.traceback.is_empty());
    }

    #[test]
    fn source_chain_is_rendered() {
        let marshalled = MarshalledException::from_error(&Outer(ZeroDivisionError));
        assert_eq!(marshalled.message, "config rejected: denominator was zero");
    }

    #[test]
    fn dyn_marshalling_uses_debug_hint() {
        let boxed: Box<dyn std::error::Error> = Box::new(ZeroDivisionError);
        let marshalled = MarshalledException::from_dyn(boxed.as_ref());
        assert_eq!(marshalled.exception_type, "ZeroDivisionError");
    }

    #[test]
    fn panic_payloads_downcast_to_strings() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        let marshalled = MarshalledException::from_panic(payload.as_ref());
        assert_eq!(marshalled.exception_type, "panic");
        assert_eq!(marshalled.message, "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("heap boom"));
        let marshalled = MarshalledException::from_panic(payload.as_ref());
        assert_eq!(marshalled.message, "heap boom");

        let payload: Box<dyn Any + Send> = Box::new(17_u8);
        let marshalled = MarshalledException::from_panic(payload.as_ref());
        assert_eq!(marshalled.message, "non-string panic payload");
    }

    #[test]
    fn survives_a_serde_round_trip() {
        let original = MarshalledException {
            exception_type: "panic".to_owned(),
            message: "boom".to_owned(),
            traceback: "frame 0\nframe 1".to_owned(),
        };
        let bytes = bincode::serde::encode_to_vec(&original, bincode::config::standard())
            .expect("encode");
        let (decoded, _): (MarshalledException, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .expect("decode");
        assert_eq!(decoded, original);
    }
}
