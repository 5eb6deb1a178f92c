//! Deterministic retry-engine behavior under the virtual clock: deadline
//! pacing, the automatic grace window, reselection of stale handles, and
//! escalation of repeated hard driver failures.

use script_driver::mock::{
    MockClock, MockElement, MockPage, SharedBuffer, mock_session, single_session_factory,
};
use script_driver::{DriverError, Error, Interpreter, Result};

fn session() -> (Interpreter, MockPage, MockClock, SharedBuffer) {
    let clock = MockClock::new();
    let (driver, page) = mock_session(&clock);
    let out = SharedBuffer::new();
    let interp = Interpreter::new(single_session_factory(driver), Box::new(clock.clone()))
        .trace_to(Box::new(out.clone()));
    (interp, page, clock, out)
}

#[test]
fn action_retries_until_the_explicit_deadline() {
    let (mut interp, page, clock, _out) = session();
    page.add(MockElement::new("input").test_id("user").value("wrong"));
    let err = interp
        .run_source(
            "retry",
            r#"browser start
               field "user"
               wait 3
               test "right""#,
        )
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed(_)));
    // Attempts are paced at 100ms and stop exactly at the deadline.
    assert_eq!(clock.now(), 3000);
    assert_eq!(interp.wait_deadline_ms(), 0);
}

#[test]
fn condition_met_mid_wait_ends_the_retry_loop() -> Result<()> {
    let (mut interp, page, clock, _out) = session();
    let user = page.add(MockElement::new("input").test_id("user").value("wrong"));
    interp.run_source("retry", "browser start\nfield \"user\"\nwait 5")?;
    // Flip the value part-way through the window from the test side.
    page.set_value(user, "right");
    interp.run_source("retry", "test \"right\"")?;
    assert!(clock.now() < 5000);
    Ok(())
}

#[test]
fn bare_action_gets_one_default_grace_window() {
    let (mut interp, page, clock, out) = session();
    page.add(MockElement::new("input").test_id("user").value("wrong"));
    let err = interp
        .run_source(
            "retry",
            r#"browser start
               field "user"
               test "right""#,
        )
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed(_)));
    assert!(out.contents().contains("auto wait 1000ms"));
    assert_eq!(clock.now(), 1000);
}

#[test]
fn default_wait_resizes_the_grace_window() {
    let (mut interp, page, clock, _out) = session();
    page.add(MockElement::new("input").test_id("user").value("wrong"));
    let err = interp
        .run_source(
            "retry",
            r#"browser start
               default wait 0.5
               field "user"
               test "right""#,
        )
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed(_)));
    assert_eq!(clock.now(), 500);
}

#[test]
fn invalid_state_recovers_within_the_grace_window() -> Result<()> {
    let (mut interp, page, clock, _out) = session();
    page.add(MockElement::new("button").test_id("go"));
    page.fail_next_interaction(DriverError::InvalidState("not interactable".into()));
    interp.run_source("retry", "browser start\nfield \"go\"\nclick")?;
    assert!(page.journal().contains(&"click go".to_string()));
    // One failed attempt, one retry interval, then success.
    assert_eq!(clock.now(), 100);
    Ok(())
}

#[test]
fn stale_handle_is_reselected_and_the_action_retried() -> Result<()> {
    let (mut interp, page, _clock, out) = session();
    let go = page.add(MockElement::new("button").test_id("go"));
    interp.run_source("retry", "browser start\nfield \"go\"")?;
    // The page re-renders between selection and action.
    page.invalidate(go);
    interp.run_source("retry", "click")?;
    assert!(page.journal().contains(&"click go".to_string()));
    assert!(out.contents().contains("reselected"));
    Ok(())
}

#[test]
fn repeated_hard_failures_escalate_to_a_driver_error() {
    let (mut interp, page, _clock, _out) = session();
    page.add(MockElement::new("button").test_id("go"));
    for _ in 0..5 {
        page.fail_next_interaction(DriverError::Session("gateway lost".into()));
    }
    let err = interp
        .run_source(
            "retry",
            r#"browser start
               field "go"
               wait 10
               click"#,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Driver(_)), "got {err:?}");
    // The click never went through.
    assert!(!page.journal().contains(&"click go".to_string()));
}

#[test]
fn retryable_failures_reset_the_hard_failure_count() -> Result<()> {
    let (mut interp, page, _clock, _out) = session();
    let user = page.add(MockElement::new("input").test_id("user").value("wrong"));
    // Hard failures interleaved with plain mismatches never accumulate to
    // the escalation threshold.
    page.fail_next_interaction(DriverError::Session("blip".into()));
    interp.run_source("retry", "browser start\nfield \"user\"\nwait 10")?;
    page.fail_next_interaction(DriverError::Session("blip".into()));
    page.set_value(user, "right");
    interp.run_source("retry", "test \"right\"")?;
    Ok(())
}
