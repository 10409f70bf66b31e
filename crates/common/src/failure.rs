//! Failure information carried from a failing step or scenario
//!
//! A `Failure` is the value-level description of whatever made a step body
//! fail: an error returned from the body, a panic, or a failure reported by
//! the test framework itself. Assertion operands travel as an explicit
//! [`Comparison`] instead of being probed off the error.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Operands of a failed comparison assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub left: String,
    pub operator: String,
    pub right: String,
}

impl Comparison {
    pub fn new(left: impl Into<String>, operator: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            operator: operator.into(),
            right: right.into(),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.operator, self.right)
    }
}

/// A recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Type name of the error, or `panic`
    pub kind: String,

    /// String form of the error; may be empty
    pub message: String,

    /// Formatted error text including its cause chain
    pub trace: String,

    /// Source line of the deepest failing frame, when the producer knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_line: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<Comparison>,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let message = message.into();
        let trace = render_head(&kind, &message);
        Self {
            kind,
            message,
            trace,
            source_line: None,
            comparison: None,
        }
    }

    /// Capture an error returned from a step body
    pub fn from_error<E>(err: &E) -> Self
    where
        E: fmt::Display + ?Sized,
    {
        Self::new(short_type_name::<E>(), err.to_string())
    }

    /// Capture a `std::error::Error` together with its `source()` chain
    pub fn from_std_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut failure = Self::new(short_type_name_of(err), err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            failure.trace.push_str("\n\nCaused by:\n    ");
            failure.trace.push_str(&cause.to_string());
            source = cause.source();
        }
        failure
    }

    /// Capture a panic payload from `catch_unwind`
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::new()
        };
        Self::new("panic", message)
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }

    pub fn with_source_line(mut self, line: impl Into<String>) -> Self {
        self.source_line = Some(line.into());
        self
    }

    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = Some(comparison);
        self
    }

    /// The message shown on a failed step: the error text, or its kind when empty
    pub fn display_message(&self) -> &str {
        if self.message.is_empty() {
            &self.kind
        } else {
            &self.message
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_head(&self.kind, &self.message))
    }
}

fn render_head(kind: &str, message: &str) -> String {
    if message.is_empty() {
        kind.to_string()
    } else {
        format!("{}: {}", kind, message)
    }
}

fn short_type_name<T: ?Sized>() -> String {
    strip_path(std::any::type_name::<T>())
}

fn short_type_name_of(err: &(dyn std::error::Error + 'static)) -> String {
    // Debug output of most error enums starts with the variant name
    let debug = format!("{:?}", err);
    let head: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if head.is_empty() {
        "Error".to_string()
    } else {
        head
    }
}

fn strip_path(name: &str) -> String {
    // `alloc::string::String` -> `String`, `core::option::Option<u8>` -> `Option<u8>`
    let base = name.split('<').next().unwrap_or(name);
    let short = base.rsplit("::").next().unwrap_or(base);
    format!("{}{}", short, &name[base.len()..])
}
