use std::fmt;

use crate::fifo::{Aborted, PeerClosed};

#[derive(Debug)]
pub enum ExecError {
    Fifo(String),
    Stage(String),
    Sort(String),
    Io(String),
    Aborted,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Fifo(s) => write!(f, "fifo error: {}", s),
            ExecError::Stage(s) => write!(f, "stage error: {}", s),
            ExecError::Sort(s) => write!(f, "sort error: {}", s),
            ExecError::Io(s) => write!(f, "io error: {}", s),
            ExecError::Aborted => write!(f, "query aborted"),
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> ExecError {
        ExecError::Io(err.to_string())
    }
}

impl From<Aborted> for ExecError {
    fn from(_: Aborted) -> ExecError {
        ExecError::Aborted
    }
}

impl From<PeerClosed> for ExecError {
    fn from(_: PeerClosed) -> ExecError {
        ExecError::Aborted
    }
}
