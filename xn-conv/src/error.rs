use crate::{ConvKind, DType};

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Main library error type.
#[derive(thiserror::Error)]
pub enum Error {
    #[error("invalid convolution config: {msg}")]
    InvalidConfig { msg: String },

    #[error("{msg}, expected: {expected:?}, got: {got:?}")]
    UnexpectedDType { msg: &'static str, expected: DType, got: DType },

    #[error("unsupported convolution kind, expected {expected}, got {got:?}")]
    UnsupportedKind { expected: &'static str, got: ConvKind },

    #[error("invalid reduction grid {grid:?} for {nthr} threads: {msg}")]
    InvalidGrid { grid: crate::ReductionGrid, nthr: usize, msg: &'static str },

    #[error("buffer {name} is too small, expected at least {expected} elements, got {got}")]
    BufferSize { name: &'static str, expected: usize, got: usize },

    /// Thread pool creation error.
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("{context}\n{inner}")]
    Context { inner: Box<Self>, context: Box<dyn std::fmt::Display + Send + Sync> },

    #[error("{inner}\n{backtrace}")]
    WithBacktrace { inner: Box<Self>, backtrace: Box<std::backtrace::Backtrace> },

    /// User generated error message, typically created via `bail!`.
    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_config(msg: impl std::fmt::Display) -> Self {
        Self::InvalidConfig { msg: msg.to_string() }.bt()
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace { inner: Box::new(self), backtrace: Box::new(backtrace) },
        }
    }

    pub fn context(self, c: impl std::fmt::Display + Send + Sync + 'static) -> Self {
        Self::Context { inner: Box::new(self), context: Box::new(c) }
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()).bt())
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()).bt())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()).bt())
    };
}

/// Attaches a description of the failing step to an error.
pub trait Context<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static;
}

impl<T> Context<T> for Result<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display + Send + Sync + 'static,
    {
        self.map_err(|e| e.context(context))
    }
}

/// Checks that a caller supplied buffer holds at least `expected` elements.
pub(crate) fn check_len<T>(buf: &[T], expected: usize, name: &'static str) -> Result<()> {
    if buf.len() < expected {
        Err(Error::BufferSize { name, expected, got: buf.len() }.bt())
    } else {
        Ok(())
    }
}

pub(crate) fn check_dtype(expected: DType, got: DType, msg: &'static str) -> Result<()> {
    if expected != got { Err(Error::UnexpectedDType { msg, expected, got }.bt()) } else { Ok(()) }
}
