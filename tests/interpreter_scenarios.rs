//! End-to-end script scenarios driven through the public interpreter API
//! against the in-memory mock session.

use script_driver::mock::{
    MockClock, MockElement, MockPage, MockScriptOutcome, SharedBuffer, mock_session,
    single_session_factory,
};
use script_driver::{Error, ExitStatus, Interpreter, Result};
use std::fs;
use std::path::PathBuf;

fn session() -> (Interpreter, MockPage, MockClock, SharedBuffer) {
    let clock = MockClock::new();
    let (driver, page) = mock_session(&clock);
    let out = SharedBuffer::new();
    let interp = Interpreter::new(single_session_factory(driver), Box::new(clock.clone()))
        .trace_to(Box::new(out.clone()));
    (interp, page, clock, out)
}

fn script_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("script_driver_{}_{test}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn login_flow_drives_the_page() -> Result<()> {
    let (mut interp, page, _clock, _out) = session();
    let user = page.add(MockElement::new("input").test_id("user").css("#user"));
    page.add(MockElement::new("button").test_id("go"));
    interp.run_source(
        "login",
        r##"browser start
           browser get "https://example.test/login"
           select "#user"
           set "alice"
           test "alice"
           field "go"
           click"##,
    )?;
    assert_eq!(page.value_of(user), "alice");
    let journal = page.journal();
    assert!(journal.contains(&"navigate https://example.test/login".to_string()));
    assert!(journal.contains(&"keys user:alice".to_string()));
    assert!(journal.contains(&"click go".to_string()));
    Ok(())
}

#[test]
fn wait_covers_late_rendering_elements() -> Result<()> {
    let (mut interp, page, clock, _out) = session();
    page.add(MockElement::new("div").test_id("late").appears_at(1000));
    interp.run_source(
        "late",
        r#"browser start
           wait 2
           field "late""#,
    )?;
    assert!(interp.has_selection());
    assert!(interp.last_test());
    assert_eq!(clock.now(), 1000);
    // The deadline stays armed for subsequent commands after a success.
    assert_eq!(interp.wait_deadline_ms(), 2000);
    Ok(())
}

#[test]
fn expired_wait_without_element_is_a_selection_error() {
    let (mut interp, _page, clock, _out) = session();
    let err = interp
        .run_source(
            "late",
            r#"browser start
               wait 1
               field "never""#,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Selection(_)));
    // Polls every 100ms until the deadline, never past it.
    assert_eq!(clock.now(), 1000);
}

#[test]
fn state_predicates_follow_the_page() -> Result<()> {
    let (mut interp, page, _clock, _out) = session();
    page.add(
        MockElement::new("input")
            .test_id("opt")
            .selected(true)
            .displayed(false),
    );
    interp.run_source(
        "state",
        r#"browser start
           field "opt"
           enabled
           selected
           not displayed"#,
    )?;
    Ok(())
}

#[test]
fn checksum_verifies_field_content() -> Result<()> {
    let (mut interp, page, _clock, _out) = session();
    // CRC-32 of the empty string is 0.
    page.add(MockElement::new("textarea").test_id("notes"));
    interp.run_source(
        "sum",
        r#"browser start
           field "notes"
           checksum "crc32:0""#,
    )?;
    Ok(())
}

#[test]
fn checksum_mismatch_fails_after_the_deadline() {
    let (mut interp, page, _clock, _out) = session();
    page.add(MockElement::new("textarea").test_id("notes").value("text"));
    let err = interp
        .run_source(
            "sum",
            r#"browser start
               field "notes"
               checksum "crc32:0""#,
        )
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed(_)));
}

#[test]
fn alert_accept_requires_an_open_alert() -> Result<()> {
    let (mut interp, page, _clock, _out) = session();
    page.open_alert();
    interp.run_source("alert", "browser start\nalert accept")?;
    assert!(!page.alert_open());
    let err = interp.run_source("alert", "alert accept").unwrap_err();
    assert!(matches!(err, Error::Driver(_)));
    Ok(())
}

#[test]
fn call_result_becomes_the_selection() -> Result<()> {
    let (mut interp, page, _clock, _out) = session();
    let row = page.add(MockElement::new("tr").test_id("row-7"));
    page.queue_script_result(MockScriptOutcome::Element(row));
    interp.run_source(
        "call",
        r#"browser start
           call "findRow" { 7, "open" }
           click"#,
    )?;
    assert!(interp.last_test());
    let journal = page.journal();
    assert!(
        journal
            .iter()
            .any(|entry| entry.contains(r#"RegressionTest.test('findRow',[7,"open"])"#)),
        "unexpected journal: {journal:?}"
    );
    assert!(journal.contains(&"click row-7".to_string()));
    Ok(())
}

#[test]
fn include_resolves_relative_to_the_including_script() -> Result<()> {
    let dir = script_dir("include");
    fs::write(dir.join("sub.script"), "echo \"from sub\"\n").unwrap();
    fs::write(
        dir.join("main.script"),
        "include \"sub.script\"\necho \"from main\"\n",
    )
    .unwrap();
    let (mut interp, _page, _clock, out) = session();
    interp.run_file(&dir.join("main.script"))?;
    let trace = out.contents();
    assert!(trace.contains("\nfrom sub\n"));
    assert!(trace.contains("\nfrom main\n"));
    Ok(())
}

#[test]
fn run_reports_success_and_invokes_the_success_handler() {
    let dir = script_dir("run_ok");
    fs::write(
        dir.join("ok.script"),
        "function --onsuccess { echo \"victory\" }\necho \"done\"\n",
    )
    .unwrap();
    let (mut interp, _page, _clock, out) = session();
    let status = interp.run(&[dir.join("ok.script")]);
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(status.code(), 0);
    assert!(out.contents().contains("\nvictory\n"));
}

#[test]
fn run_reports_script_error_and_invokes_the_failure_handler() {
    let dir = script_dir("run_fail");
    fs::write(
        dir.join("bad.script"),
        "function --onfail { echo \"cleanup ran\" }\nbrowser start\nfield \"missing\"\n",
    )
    .unwrap();
    let (mut interp, page, _clock, out) = session();
    let status = interp.run(&[dir.join("bad.script")]);
    assert_eq!(status, ExitStatus::ScriptError);
    assert_eq!(status.code(), 1);
    assert!(out.contents().contains("\ncleanup ran\n"));
    // The session is quit once the handler has run.
    assert!(page.journal().contains(&"quit".to_string()));
}

#[test]
fn run_reports_a_failing_failure_handler_distinctly() {
    let dir = script_dir("run_handler_fail");
    fs::write(
        dir.join("bad.script"),
        "function --onfail { fail \"handler gave up\" }\nfail \"script failed\"\n",
    )
    .unwrap();
    let (mut interp, _page, _clock, _out) = session();
    let status = interp.run(&[dir.join("bad.script")]);
    assert_eq!(status, ExitStatus::HandlerError);
    assert_eq!(status.code(), 2);
}

#[cfg(unix)]
#[test]
fn exec_traces_child_output() -> Result<()> {
    let (mut interp, _page, _clock, out) = session();
    interp.run_source("exec", "exec \"/bin/echo\" { hello world }")?;
    assert!(out.contents().contains("\nhello world\n"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn exec_include_interprets_child_output() -> Result<()> {
    let (mut interp, _page, _clock, out) = session();
    interp.run_source("exec", "exec-include \"/bin/echo\" { echo fed-back }")?;
    assert!(out.contents().contains("\nfed-back\n"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn exec_failure_status_is_an_error() {
    let (mut interp, _page, _clock, _out) = session();
    let err = interp.run_source("exec", "exec \"/bin/false\"").unwrap_err();
    assert!(matches!(err, Error::Exec(_)));
}
