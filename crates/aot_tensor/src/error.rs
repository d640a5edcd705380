use aot_common::report_error::{report_error, Report, Reportable};
use std::io;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("'{op}' expected shape {expected:?} but found {found:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("invalid arguments to '{op}': {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("a leaf value that requires grad is being used in an in-place operation")]
    LeafMutation,

    #[error("'{0}' is not differentiable")]
    NotDifferentiable(&'static str),

    /// The program uses an aliasing or mutation pattern which cannot be compiled soundly.
    #[error("{0}")]
    Unsupported(String),

    /// A compiled artifact was invoked with arguments that violate an assumption made when it was
    /// compiled.
    #[error("{0}")]
    GuardViolation(String),

    #[error("metadata self-check failed: {0}")]
    SelfCheck(String),

    #[error("compiled functions do not support double backward")]
    DoubleBackward,

    #[error("expected an entirely functional graph, but found {0}")]
    NonFunctionalGraph(String),

    #[error("compiler failed: {0}")]
    Compile(String),

    #[error("{0}")]
    Invariant(String),
}

impl Error {
    pub fn invalid(op: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    fn title(&self) -> &'static str {
        use Error::*;
        match self {
            ShapeMismatch { .. } | InvalidArgument { .. } => "Invalid Operation",
            LeafMutation | NotDifferentiable(_) => "Autograd Error",
            Unsupported(_) => "Unsupported Pattern",
            GuardViolation(_) => "Guard Violation",
            SelfCheck(_) => "Self-Check Failure",
            DoubleBackward => "Double Backward",
            NonFunctionalGraph(_) => "Non-Functional Graph",
            Compile(_) => "Compiler Failure",
            Invariant(_) => "Internal Error",
        }
    }
}

impl Reportable for Error {
    fn report(&self, dest: &mut impl io::Write) -> io::Result<()> {
        report_error(
            dest,
            Report {
                title: self.title(),
                context: None,
                message: Some(&self.to_string()),
            },
        )
    }

    fn exit_status(&self) -> i32 {
        match self {
            Error::Invariant(_) | Error::SelfCheck(_) => 101,
            _ => 1,
        }
    }
}
