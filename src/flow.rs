use std::collections::HashMap;

pub(crate) const DEFAULT_WAIT_MS: u64 = 1000;

/// Conditional and wait state threaded through the dispatcher.
///
/// `skip` is true only between a `then`/`else` and the matching `endif`.
/// `wait_until` is an absolute millisecond timestamp; 0 means no deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ControlFlow {
    pub if_open: bool,
    pub last_test: bool,
    pub skip: bool,
    negate_next: bool,
    pub wait_until: u64,
    pub default_wait_ms: u64,
}

impl ControlFlow {
    pub fn new() -> Self {
        Self {
            if_open: false,
            last_test: false,
            skip: false,
            negate_next: false,
            wait_until: 0,
            default_wait_ms: DEFAULT_WAIT_MS,
        }
    }

    pub fn set_negate(&mut self) {
        self.negate_next = true;
    }

    /// Consumes the negation flag. Every negation-aware command reads it
    /// through here exactly once per invocation, so negation cannot leak
    /// into an unrelated subsequent command.
    pub fn take_negate(&mut self) -> bool {
        std::mem::take(&mut self.negate_next)
    }
}

/// Named LIFO store for saved scalar state. Currently only the `wait`
/// deadline uses it, but the store stays generic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WaitStacks {
    stacks: HashMap<String, Vec<u64>>,
}

impl WaitStacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: u64) {
        self.stacks.entry(name.to_string()).or_default().push(value);
    }

    /// Removes and returns the most recent value; `None` when the stack is
    /// empty or absent (an unbalanced pop, reported by the caller).
    pub fn pop(&mut self, name: &str) -> Option<u64> {
        self.stacks.get_mut(name)?.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_negate_consumes_the_flag() {
        let mut flow = ControlFlow::new();
        assert!(!flow.take_negate());
        flow.set_negate();
        assert!(flow.take_negate());
        assert!(!flow.take_negate());
    }

    #[test]
    fn stacks_are_lifo_per_name() {
        let mut stacks = WaitStacks::new();
        stacks.push("wait", 10);
        stacks.push("wait", 20);
        assert_eq!(stacks.pop("wait"), Some(20));
        assert_eq!(stacks.pop("wait"), Some(10));
        assert_eq!(stacks.pop("wait"), None);
        assert_eq!(stacks.pop("other"), None);
    }
}
