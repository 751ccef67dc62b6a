use std::future::Future;
use std::panic::Location;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Span;

use crate::error::Error;
use crate::error::Result;

/// Per-call logging flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpOptions {
    /// Don't log errors of this call at all.
    pub no_log:      bool,
    /// Don't log `NoData`.
    pub quiet:       bool,
    pub caller_pos:  Option<String>,
    pub trace_id:    u64,
    pub description: Option<String>,
}

/// Caller context of a cache operation: an optional deadline and the logging options.
///
/// Every remote and SQL store call made on behalf of the operation is bounded by the deadline. Dropping the
/// operation's future cancels it.
#[derive(Debug, Clone, Default)]
pub struct Ctx {
    deadline: Option<Instant>,
    options:  OpOptions,
}

impl Ctx {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that records the caller's source position.
    #[track_caller]
    pub fn here() -> Self {
        let loc = Location::caller();
        Self {
            deadline: None,
            options:  OpOptions {
                caller_pos: Some(format!("{}:{}", loc.file(), loc.line())),
                ..OpOptions::default()
            },
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_options(mut self, options: OpOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_trace_id(mut self, trace_id: u64) -> Self {
        self.options.trace_id = trace_id;
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.options.description = Some(description.into());
        self
    }

    pub fn quiet(mut self) -> Self {
        self.options.quiet = true;
        self
    }

    pub fn no_log(mut self) -> Self {
        self.options.no_log = true;
        self
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline]
    pub fn options(&self) -> &OpOptions {
        &self.options
    }

    /// Await a backend call within the deadline.
    pub(crate) async fn run<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        Error: From<E>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| Error::DeadlineExceeded)?
                .map_err(Error::from),
            None => fut.await.map_err(Error::from),
        }
    }

    pub(crate) fn span(&self, op: &'static str, table: &str, key: &str) -> Span {
        tracing::debug_span!(
            "mrcache",
            op,
            table,
            key,
            trace_id = self.options.trace_id,
            caller = self.options.caller_pos.as_deref(),
            description = self.options.description.as_deref(),
        )
    }

    /// Log an operation error following the context's flags.
    pub(crate) fn report(&self, op: &str, key: &str, err: &Error) {
        if self.options.no_log {
            return;
        }
        if err.is_no_data() {
            if !self.options.quiet {
                tracing::debug!(op, key, "no data");
            }
        }
        else {
            tracing::error!(op, key, trace_id = self.options.trace_id, "{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn here_records_position() {
        let ctx = Ctx::here();
        let pos = ctx.options().caller_pos.clone().unwrap();
        assert!(pos.starts_with(file!()), "{pos}");
    }

    #[tokio::test]
    async fn deadline_bounds_calls() {
        let ctx = Ctx::new().with_timeout(Duration::from_millis(10));
        let res: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>(())
            })
            .await;
        assert!(matches!(res, Err(Error::DeadlineExceeded)));
    }
}
