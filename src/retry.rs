use super::*;

pub(crate) const RETRY_INTERVAL_MS: u64 = 100;

// Consecutive failures outside the recoverable classes tolerated before the
// engine escalates to a fatal driver error.
const MAX_HARD_FAILURES: u32 = 3;

/// Outcome of one attempt inside the wait/retry engine.
///
/// `Retryable` is the distinguished signal predicate closures raise when the
/// condition is false: it unifies "wait until a condition holds" with "retry
/// until an action sticks".
pub(crate) enum StepError {
    Retryable(String),
    Driver(DriverError),
    Fatal(Error),
}

impl From<DriverError> for StepError {
    fn from(err: DriverError) -> Self {
        Self::Driver(err)
    }
}

pub(crate) type StepResult = std::result::Result<(), StepError>;

impl Interpreter {
    /// Runs `action` against the current selection until it succeeds or the
    /// wait deadline expires.
    ///
    /// Recoverable failures (stale handle, invalid element state, generic
    /// driver error, explicit retryable signal) trigger a bounded sleep and a
    /// reselection of the current selection via its stored descriptor; an
    /// invalid-state or generic driver error additionally nudges the element
    /// into view. Other failure classes escalate to fatal after more than
    /// three in a row. A bare action whose deadline has already elapsed gets
    /// one default grace window on its first retry.
    pub(crate) fn wait_for<F>(
        &mut self,
        what: &str,
        line: u32,
        needs_selection: bool,
        mut action: F,
    ) -> Result<()>
    where
        F: FnMut(&mut dyn Driver, Option<&dyn Element>) -> StepResult,
    {
        if needs_selection && !self.selection.is_resolved() {
            return Err(Error::Precondition(format!(
                "{what} requires a current selection at line {line}"
            )));
        }
        let mut first_failure = true;
        let mut hard_failures = 0u32;
        loop {
            let outcome = {
                let Some(session) = self.session.as_deref_mut() else {
                    return Err(Error::Precondition(format!(
                        "browser start must be used before `{what}` at line {line}"
                    )));
                };
                action(session, self.selection.handle.as_deref())
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(StepError::Fatal(err)) => return Err(err),
                Err(StepError::Retryable(note)) => {
                    self.trace_note(&note);
                    hard_failures = 0;
                }
                Err(StepError::Driver(DriverError::Stale)) => {
                    self.trace_note("// stale element reference");
                    hard_failures = 0;
                }
                Err(StepError::Driver(
                    err @ (DriverError::InvalidState(_) | DriverError::Other(_)),
                )) => {
                    self.trace_note(&format!("// driver error: {err}"));
                    self.scroll_selection_nudge();
                    hard_failures = 0;
                }
                Err(StepError::Driver(err)) => {
                    self.trace_note(&format!("// driver error: {err}"));
                    hard_failures += 1;
                    if hard_failures > MAX_HARD_FAILURES {
                        return Err(Error::Driver(format!("{what}: {err} at line {line}")));
                    }
                }
            }
            let now = self.clock.now_ms();
            if first_failure && self.flow.wait_until <= now {
                self.flow.wait_until = now + self.flow.default_wait_ms;
                self.trace_note(&format!("// auto wait {}ms", self.flow.default_wait_ms));
            }
            first_failure = false;
            if self.clock.now_ms() >= self.flow.wait_until {
                break;
            }
            self.clock.sleep_ms(RETRY_INTERVAL_MS);
            self.reselect()?;
        }
        self.flow.wait_until = 0;
        self.selection_diagnostics();
        Err(Error::CommandFailed(format!("{what} failed at line {line}")))
    }
}
