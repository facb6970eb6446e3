//! Error type.
//!
//! This is the shared error type for the whole crate. Every error produced
//! while compiling or executing a graph carries the offending node's source
//! trace (when the builder captured one) and the node's printed form, so the
//! message points back at user code rather than at compiler internals.

use std::{error, fmt};

#[derive(Clone, Debug)]
pub enum Error {
    /// A value was consumed before anything wrote it.
    ReadUndefined { node: String, trace: String },
    /// The same value was passed twice to one call with differing access.
    SameArgumentDifferentAccess {
        node: String,
        trace: String,
        first_access: &'static str,
        second_access: &'static str,
    },
    /// A resource was acquired while an overlapping acquisition was live.
    DuplicatedResource {
        node: String,
        trace: String,
        previous: String,
        previous_trace: String,
    },
    /// A convergence was built over operands that do not share storage.
    IncompatibleConverge { node: String, trace: String },
    /// A node had to be evaluated on the host but depends on a non-constant.
    CannotEvaluate { node: String, trace: String },
    /// An attachment extent could not be resolved by inference.
    ExtentUnresolved { node: String, trace: String },
    /// The backing allocator ran out of memory.
    OutOfMemory,
    /// The device backend failed a creation or recording call.
    Backend { call: &'static str, code: i32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ReadUndefined { node, trace } => write!(
                f,
                "tried to read something that was never written: {}\n  declared/discarded on {}",
                node, trace
            ),
            Error::SameArgumentDifferentAccess {
                node,
                trace,
                first_access,
                second_access,
            } => write!(
                f,
                "tried to pass the same value twice with different access ({} vs {}): {}\n  on {}",
                first_access, second_access, node, trace
            ),
            Error::DuplicatedResource {
                node,
                trace,
                previous,
                previous_trace,
            } => write!(
                f,
                "tried to acquire something that was already known: {}\n  on {}\n  previously acquired by {} on {}",
                node, trace, previous, previous_trace
            ),
            Error::IncompatibleConverge { node, trace } => write!(
                f,
                "convergence over operands that do not share storage: {}\n  on {}",
                node, trace
            ),
            Error::CannotEvaluate { node, trace } => write!(
                f,
                "value must be known on the host but depends on a non-constant: {}\n  on {}",
                node, trace
            ),
            Error::ExtentUnresolved { node, trace } => write!(
                f,
                "could not infer an extent for attachment: {}\n  on {}",
                node, trace
            ),
            Error::OutOfMemory => write!(f, "backing allocator returned out-of-memory"),
            Error::Backend { call, code } => {
                write!(f, "device backend returned {} from {}", code, call)
            }
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = ::std::result::Result<T, Error>;
