//! Runtime error kinds
//!
//! A `RuntimeError` unwinds the current interpreter invocation. The
//! outermost call boundary converts it to integer 0 and logs a traceback;
//! no runtime error ever escapes to the event loop.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// An operand had the wrong type for the operation.
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// Array subscript outside the current size (reads) or the declared
    /// bound (writes).
    OutOfBounds { index: i64, size: u32 },
    DivisionByZero,
    /// A call or graph operation named an object that does not exist or
    /// has been destructed.
    MissingObject,
    /// A late-bound or cross-object call found no function of this name.
    MissingFunction(String),
    /// A builtin was invoked with the wrong number of arguments.
    BadArgCount { name: &'static str, found: u32 },
    /// Operand stack underflow; indicates corrupt bytecode.
    StackUnderflow,
    /// The per-invocation (hard) or per-command (soft) instruction cap
    /// was exceeded.
    CycleLimit { hard: bool },
    /// Anything else a builtin wants to report with its own text.
    Other(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {}, got {}", expected, found)
            }
            RuntimeError::OutOfBounds { index, size } => {
                write!(f, "subscript {} out of bounds (size {})", index, size)
            }
            RuntimeError::DivisionByZero => write!(f, "division by zero"),
            RuntimeError::MissingObject => write!(f, "no such object"),
            RuntimeError::MissingFunction(name) => {
                write!(f, "no such function '{}'", name)
            }
            RuntimeError::BadArgCount { name, found } => {
                write!(f, "wrong argument count for {}() ({} given)", name, found)
            }
            RuntimeError::StackUnderflow => write!(f, "operand stack underflow"),
            RuntimeError::CycleLimit { hard } => {
                if *hard {
                    write!(f, "hard cycle limit exceeded")
                } else {
                    write!(f, "soft cycle limit exceeded")
                }
            }
            RuntimeError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = RuntimeError::TypeMismatch {
            expected: "integer",
            found: "string",
        };
        assert_eq!(e.to_string(), "type mismatch: expected integer, got string");
        assert_eq!(
            RuntimeError::OutOfBounds { index: 9, size: 3 }.to_string(),
            "subscript 9 out of bounds (size 3)"
        );
    }
}
