use super::blocks::{read_args_list, read_block, read_params};
use super::flow::{ControlFlow, WaitStacks};
use super::retry::{RETRY_INTERVAL_MS, StepError};
use super::tokenizer::number_text;
use super::*;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

const ON_SUCCESS: &str = "--onsuccess";
const ON_FAIL: &str = "--onfail";
const UNCAUGHT_PATTERN: &str = r"Uncaught .* Error:";
const DEBUGGER_PAUSE_MS: u64 = 10_000;

/// Outcome of a full [`Interpreter::run`] invocation, mirroring the process
/// exit codes embedders are expected to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    ScriptError,
    HandlerError,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::ScriptError => 1,
            Self::HandlerError => 2,
        }
    }
}

// The closed command set. Resolving the word once through `lookup` keeps the
// dispatcher a single match instead of a string-equality chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Version,
    Browser,
    Alias,
    Function,
    While,
    Include,
    Exec,
    ExecInclude,
    Log,
    Default,
    Push,
    Pop,
    Echo,
    Field,
    Select,
    Xpath,
    Wait,
    If,
    Then,
    Else,
    Endif,
    Not,
    Set,
    Send,
    Check,
    Checksum,
    Click,
    ScrollIntoView,
    Clear,
    Call,
    Enabled,
    Selected,
    Displayed,
    At,
    Size,
    Tag,
    Info,
    Alert,
    Dump,
    Mouse,
    Sleep,
    Fail,
    Debugger,
}

impl Command {
    fn lookup(word: &str) -> Option<Self> {
        Some(match word {
            "version" => Self::Version,
            "browser" => Self::Browser,
            "alias" => Self::Alias,
            "function" => Self::Function,
            "while" => Self::While,
            "include" => Self::Include,
            "exec" => Self::Exec,
            "exec-include" => Self::ExecInclude,
            "log" => Self::Log,
            "default" => Self::Default,
            "push" => Self::Push,
            "pop" => Self::Pop,
            "echo" => Self::Echo,
            "field" | "id" | "test-id" => Self::Field,
            "select" => Self::Select,
            "xpath" => Self::Xpath,
            "wait" => Self::Wait,
            "if" => Self::If,
            "then" => Self::Then,
            "else" => Self::Else,
            "endif" => Self::Endif,
            "not" => Self::Not,
            "set" => Self::Set,
            "send" => Self::Send,
            "test" | "check" => Self::Check,
            "checksum" => Self::Checksum,
            "click" => Self::Click,
            "scroll-into-view" => Self::ScrollIntoView,
            "clear" => Self::Clear,
            "call" => Self::Call,
            "enabled" => Self::Enabled,
            "selected" => Self::Selected,
            "displayed" => Self::Displayed,
            "at" => Self::At,
            "size" => Self::Size,
            "tag" => Self::Tag,
            "info" => Self::Info,
            "alert" => Self::Alert,
            "dump" => Self::Dump,
            "mouse" => Self::Mouse,
            "sleep" => Self::Sleep,
            "fail" => Self::Fail,
            "debugger" => Self::Debugger,
            _ => return None,
        })
    }
}

fn compare_strings(actual: &str, expected: &str, checksum: bool) -> bool {
    if checksum {
        format!("crc32:{}", crc32fast::hash(actual.as_bytes())) == expected
    } else {
        actual.nfc().eq(expected.nfc())
    }
}

fn is_field_tag(tag: &str) -> bool {
    matches!(tag, "input" | "select" | "textarea")
}

// Best-effort one-line snapshot of an element, replayable as script text.
fn element_info_line(element: &dyn Element, provenance: &str) -> DriverResult<String> {
    let location = element.location()?;
    let size = element.size()?;
    let tag = element.tag_name()?;
    let mut line = format!(
        "{provenance} info tag {tag} at {},{} size {},{}",
        location.x, location.y, size.width, size.height
    );
    line.push_str(if element.is_displayed()? {
        " displayed"
    } else {
        " not displayed"
    });
    line.push_str(if element.is_enabled()? {
        " enabled"
    } else {
        " not enabled"
    });
    line.push_str(if element.is_selected()? {
        " selected"
    } else {
        " not selected"
    });
    if is_field_tag(&tag) {
        let value = element.attribute("value")?.unwrap_or_default();
        if tag == "textarea" {
            line.push_str(&format!(
                " checksum \"crc32:{}\"",
                crc32fast::hash(value.as_bytes())
            ));
        } else {
            line.push_str(&format!(" check \"{value}\""));
        }
    } else {
        line.push_str(&format!(" check \"{}\"", element.text()?));
    }
    Ok(line)
}

/// The interpreter: dispatcher loop plus all of its state — browser session,
/// current selection, control flow, function/alias table, wait stacks, clock
/// and trace sink. Instances are independent; nothing is ambient.
pub struct Interpreter {
    factory: DriverFactory,
    pub(crate) session: Option<Box<dyn Driver>>,
    config: BrowserConfig,
    pub(crate) selection: Selection,
    pub(crate) flow: ControlFlow,
    functions: HashMap<String, ExecutionContext>,
    stacks: WaitStacks,
    pub(crate) clock: Box<dyn Clock>,
    out: Box<dyn Write>,
    autolog: bool,
    base_dir: PathBuf,
    uncaught: Option<fancy_regex::Regex>,
}

impl Interpreter {
    pub fn new(factory: DriverFactory, clock: Box<dyn Clock>) -> Self {
        Self {
            factory,
            session: None,
            config: BrowserConfig::default(),
            selection: Selection::empty(),
            flow: ControlFlow::new(),
            functions: HashMap::new(),
            stacks: WaitStacks::new(),
            clock,
            out: Box::new(io::stdout()),
            autolog: false,
            base_dir: PathBuf::from("."),
            uncaught: fancy_regex::Regex::new(UNCAUGHT_PATTERN).ok(),
        }
    }

    /// Redirects the command trace, which by default goes to stdout.
    pub fn trace_to(mut self, sink: Box<dyn Write>) -> Self {
        self.out = sink;
        self
    }

    pub fn last_test(&self) -> bool {
        self.flow.last_test
    }

    pub fn wait_deadline_ms(&self) -> u64 {
        self.flow.wait_until
    }

    pub fn has_selection(&self) -> bool {
        self.selection.is_resolved()
    }

    /// Runs scripts in order, then the `--onsuccess` or `--onfail` handler
    /// if the script defined one, then quits the browser session.
    pub fn run<P: AsRef<Path>>(&mut self, scripts: &[P]) -> ExitStatus {
        let mut status = ExitStatus::Success;
        let mut handler = ON_SUCCESS;
        for script in scripts {
            if let Err(err) = self.run_file(script.as_ref()) {
                self.trace_note(&format!("// error: {err}"));
                handler = ON_FAIL;
                status = ExitStatus::ScriptError;
                break;
            }
        }
        if self.functions.contains_key(handler) {
            if let Err(err) = self.invoke_handler(handler) {
                self.trace_note(&format!("// error in {handler} handler: {err}"));
                status = ExitStatus::HandlerError;
            }
        }
        if let Some(mut session) = self.session.take() {
            let _ = session.quit();
        }
        status
    }

    pub fn run_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Io(format!("{}: {err}", path.display())))?;
        let saved = self.base_dir.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                self.base_dir = parent.to_path_buf();
            }
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let result = self.run_tokens(&name, &text, None);
        self.base_dir = saved;
        result
    }

    pub fn run_source(&mut self, source: &str, text: &str) -> Result<()> {
        self.run_tokens(source, text, None)
    }

    fn invoke_handler(&mut self, name: &str) -> Result<()> {
        let Some(ctx) = self.functions.get(name).cloned() else {
            return Ok(());
        };
        let body = ctx.body.clone();
        self.run_tokens(name, &body, Some(&ctx))
    }

    fn run_tokens(&mut self, source: &str, text: &str, ctx: Option<&ExecutionContext>) -> Result<()> {
        let mut tok = Tokenizer::new(text);
        loop {
            match tok.next_token()? {
                Token::Eof => return Ok(()),
                Token::Word(word) => self.run_command(&mut tok, &word, source, ctx)?,
                _ => {}
            }
        }
    }

    fn run_command(
        &mut self,
        tok: &mut Tokenizer,
        word: &str,
        source: &str,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        if self.autolog && self.session.is_some() {
            self.dump_console_log()?;
        }
        let line = tok.line();
        let word = match ctx {
            Some(c) => c.substitute_word(word),
            None => word.to_string(),
        };
        let Some(cmd) = Command::lookup(&word) else {
            if self.functions.contains_key(&word) {
                return self.invoke(&word, tok, source, line, ctx);
            }
            return Err(Error::UnrecognizedCommand(format!(
                "{word} at line {line} of {source}"
            )));
        };
        // Predicate commands record their outcome in `last_test` rather than
        // failing while an `if` condition is open. Selection commands apply
        // the same rule inside `resolve_selection`.
        let predicate = matches!(
            cmd,
            Command::Check
                | Command::Checksum
                | Command::Enabled
                | Command::Selected
                | Command::Displayed
                | Command::At
                | Command::Size
                | Command::Tag
        );
        let skipped = self.flow.skip;
        let result = match cmd {
            Command::Version => {
                self.trace(source, line, &format!("version {}", env!("CARGO_PKG_VERSION")));
                Ok(())
            }
            Command::Browser => self.cmd_browser(tok, source, line, ctx),
            Command::Alias => self.cmd_alias(tok, source, line),
            Command::Function => self.cmd_function(tok, source, line),
            Command::While => self.cmd_while(tok, source, line, ctx),
            Command::Include => self.cmd_include(tok, source, line, ctx),
            Command::Exec => self.cmd_exec(tok, source, line, ctx, false),
            Command::ExecInclude => self.cmd_exec(tok, source, line, ctx, true),
            Command::Log => self.cmd_log(tok, source, line),
            Command::Default => self.cmd_default(tok, source, line, ctx),
            Command::Push | Command::Pop => self.cmd_push_pop(cmd, tok, source, line),
            Command::Echo => self.cmd_echo(tok, source, line, ctx),
            Command::Field => self.cmd_resolve(tok, source, line, ctx, SelectorKind::FieldId, "field"),
            Command::Select => {
                self.cmd_resolve(tok, source, line, ctx, SelectorKind::CssSelect, "select")
            }
            Command::Xpath => self.cmd_resolve(tok, source, line, ctx, SelectorKind::XPath, "xpath"),
            Command::Wait => self.cmd_wait(tok, source, line, ctx),
            Command::If => {
                self.trace(source, line, "if");
                self.flow.if_open = true;
                Ok(())
            }
            Command::Then => {
                self.trace(source, line, "then");
                self.flow.if_open = false;
                self.flow.skip = !self.flow.last_test;
                Ok(())
            }
            Command::Else => {
                self.trace(source, line, "else");
                self.flow.if_open = false;
                self.flow.skip = self.flow.last_test;
                Ok(())
            }
            Command::Endif => {
                self.trace(source, line, "endif");
                self.flow.skip = false;
                Ok(())
            }
            Command::Not => {
                self.trace(source, line, "not");
                if !self.flow.skip {
                    self.flow.set_negate();
                }
                Ok(())
            }
            Command::Set | Command::Send => self.cmd_set(cmd, tok, source, line, ctx),
            Command::Check | Command::Checksum => self.cmd_check(cmd, tok, source, line, ctx),
            Command::Click => self.cmd_click(source, line),
            Command::ScrollIntoView => self.cmd_scroll_into_view(source, line),
            Command::Clear => self.cmd_clear(source, line),
            Command::Call => self.cmd_call(tok, source, line, ctx),
            Command::Enabled | Command::Selected | Command::Displayed => {
                self.cmd_state_predicate(cmd, source, line)
            }
            Command::At => self.cmd_at(tok, source, line, ctx),
            Command::Size => self.cmd_size(tok, source, line, ctx),
            Command::Tag => self.cmd_tag(tok, source, line, ctx),
            Command::Info => self.cmd_info(source, line),
            Command::Alert => self.cmd_alert(tok, source, line),
            Command::Dump => self.cmd_dump(source, line),
            Command::Mouse => self.cmd_mouse(tok, source, line),
            Command::Sleep => self.cmd_sleep(tok, source, line, ctx),
            Command::Fail => self.cmd_fail(tok, source, line, ctx),
            Command::Debugger => {
                self.trace(source, line, "debugger");
                if !self.flow.skip {
                    self.clock.sleep_ms(DEBUGGER_PAUSE_MS);
                }
                Ok(())
            }
        };
        if !predicate || skipped {
            return result;
        }
        match result {
            Ok(()) => {
                self.flow.last_test = true;
                Ok(())
            }
            Err(Error::CommandFailed(_)) if self.flow.if_open => {
                self.flow.last_test = false;
                Ok(())
            }
            other => other,
        }
    }

    // ---- argument helpers -------------------------------------------------

    fn next_text(
        &mut self,
        tok: &mut Tokenizer,
        ctx: Option<&ExecutionContext>,
        what: &str,
        line: u32,
    ) -> Result<String> {
        match tok.next_token()? {
            Token::Word(w) => Ok(match ctx {
                Some(c) => c.substitute_word(&w),
                None => w,
            }),
            Token::Quoted(s) => Ok(match ctx {
                Some(c) => c.substitute_string(&s),
                None => s,
            }),
            other => Err(Error::Syntax(format!(
                "{what} requires a text argument, found {} at line {line}",
                other.describe()
            ))),
        }
    }

    fn next_word_raw(&mut self, tok: &mut Tokenizer, what: &str, line: u32) -> Result<String> {
        match tok.next_token()? {
            Token::Word(w) => Ok(w),
            Token::Quoted(s) => Ok(s),
            other => Err(Error::Syntax(format!(
                "{what} requires a word argument, found {} at line {line}",
                other.describe()
            ))),
        }
    }

    fn next_number(
        &mut self,
        tok: &mut Tokenizer,
        ctx: Option<&ExecutionContext>,
        what: &str,
        line: u32,
    ) -> Result<f64> {
        match tok.next_token()? {
            Token::Number(n) => Ok(n),
            Token::Word(w) if w.starts_with('$') => {
                match ctx.and_then(|c| c.numeric_value(&w)) {
                    Some(n) => Ok(n),
                    None => Err(Error::ArgumentType(format!(
                        "{what} requires a number, `{w}` is not bound to one at line {line}"
                    ))),
                }
            }
            other => Err(Error::Syntax(format!(
                "{what} requires a numeric argument, found {} at line {line}",
                other.describe()
            ))),
        }
    }

    fn expect_punct(&mut self, tok: &mut Tokenizer, c: char, what: &str, line: u32) -> Result<()> {
        match tok.next_token()? {
            Token::Punct(p) if p == c => Ok(()),
            other => Err(Error::Syntax(format!(
                "{what} expected `{c}`, found {} at line {line}",
                other.describe()
            ))),
        }
    }

    fn session_mut(&mut self) -> Result<&mut dyn Driver> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(Error::Precondition(
                "browser start must be used before interacting with the browser".into(),
            )),
        }
    }

    pub(crate) fn trace(&mut self, source: &str, line: u32, text: &str) {
        let _ = writeln!(self.out, "[{source},{line}] {text}");
    }

    pub(crate) fn trace_note(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.base_dir.join(candidate)
        }
    }

    // ---- selection resolution and reselection -----------------------------

    /// Resolves a new selection from a selector, retrying every 100ms while
    /// a wait deadline is pending, then applying the `if`/`not` outcome
    /// rules. The negation flag is consumed on every path out.
    fn resolve_selection(
        &mut self,
        kind: SelectorKind,
        value: String,
        provenance: String,
        line: u32,
    ) -> Result<()> {
        let negate = self.flow.take_negate();
        self.selection.clear();
        let descriptor = SelectorDescriptor { kind, value };
        let Some(locator) = descriptor.locator() else {
            return Err(Error::Selection(format!(
                "{provenance} is not resolvable at line {line}"
            )));
        };
        loop {
            let found = {
                let session = self.session_mut()?;
                session.find_element(&locator)
            };
            match found {
                Ok(handle) => {
                    if negate {
                        // Expected absence, found presence.
                        self.flow.last_test = false;
                        self.flow.wait_until = 0;
                        if self.flow.if_open {
                            return Ok(());
                        }
                        return Err(Error::Selection(format!(
                            "not {provenance} matched an element at line {line}"
                        )));
                    }
                    self.flow.last_test = true;
                    self.selection = Selection {
                        descriptor: descriptor.clone(),
                        provenance: provenance.clone(),
                        handle: Some(handle),
                    };
                    return Ok(());
                }
                Err(err) => {
                    let now = self.clock.now_ms();
                    if self.flow.wait_until > now {
                        self.clock.sleep_ms(RETRY_INTERVAL_MS);
                        continue;
                    }
                    self.flow.wait_until = 0;
                    self.flow.last_test = false;
                    if negate {
                        // Absence was the expected outcome.
                        self.flow.last_test = true;
                        return Ok(());
                    }
                    if self.flow.if_open {
                        return Ok(());
                    }
                    return Err(Error::Selection(format!(
                        "{provenance} did not resolve at line {line}: {err}"
                    )));
                }
            }
        }
    }

    /// Re-runs the stored selector descriptor to refresh a stale handle.
    /// Not-found is swallowed, leaving the stale handle for the next attempt.
    pub(crate) fn reselect(&mut self) -> Result<()> {
        if self.autolog {
            self.dump_console_log()?;
        }
        let descriptor = self.selection.descriptor.clone();
        match descriptor.kind {
            SelectorKind::None => Ok(()),
            SelectorKind::FieldId | SelectorKind::CssSelect | SelectorKind::XPath => {
                let Some(locator) = descriptor.locator() else {
                    return Ok(());
                };
                let found = {
                    let Some(session) = self.session.as_deref_mut() else {
                        return Ok(());
                    };
                    session.find_element(&locator)
                };
                match found {
                    Ok(handle) => {
                        self.selection.handle = Some(handle);
                        self.trace_note(&format!("// reselected {}", self.selection.provenance));
                        Ok(())
                    }
                    Err(DriverError::NotFound(_)) => Ok(()),
                    Err(err) => Err(Error::Driver(err.to_string())),
                }
            }
            SelectorKind::ScriptResult => {
                let result = {
                    let Some(session) = self.session.as_deref_mut() else {
                        return Ok(());
                    };
                    session.execute_async_script(&descriptor.value)
                };
                match result {
                    Ok(ScriptValue::Element(handle)) => {
                        self.selection.handle = Some(handle);
                        self.trace_note(&format!("// reselected {}", self.selection.provenance));
                        Ok(())
                    }
                    Ok(_) | Err(DriverError::NotFound(_)) => Ok(()),
                    Err(err) => Err(Error::Driver(err.to_string())),
                }
            }
        }
    }

    pub(crate) fn scroll_selection_nudge(&mut self) {
        if let (Some(session), Some(element)) = (
            self.session.as_deref_mut(),
            self.selection.handle.as_deref(),
        ) {
            let _ = session.scroll_into_view(element);
        }
    }

    /// Best-effort snapshot of the current selection, traced before a fatal
    /// selection/action failure.
    pub(crate) fn selection_diagnostics(&mut self) {
        let rendered = match self.selection.handle.as_deref() {
            Some(element) => element_info_line(element, &self.selection.provenance).ok(),
            None => None,
        };
        if let Some(line) = rendered {
            self.trace_note(&line);
        }
    }

    fn dump_console_log(&mut self) -> Result<()> {
        let entries = {
            let Some(session) = self.session.as_deref_mut() else {
                return Ok(());
            };
            session
                .console_log()
                .map_err(|err| Error::Driver(err.to_string()))?
        };
        let mut uncaught = false;
        for entry in &entries {
            let severe_error = entry.level == LogLevel::Severe
                && self
                    .uncaught
                    .as_ref()
                    .is_some_and(|re| re.is_match(&entry.message).unwrap_or(false));
            self.trace_note(&format!("// console {} {}", entry.level, entry.message));
            if severe_error {
                self.trace_note("// *** uncaught error ***");
                uncaught = true;
            }
        }
        if uncaught {
            return Err(Error::Exec(
                "unhandled exception, check console log for details".into(),
            ));
        }
        Ok(())
    }

    // ---- command handlers -------------------------------------------------

    fn cmd_browser(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let sub = self.next_word_raw(tok, "browser", line)?;
        match sub.as_str() {
            "prefs" => {
                let pref = self.next_text(tok, ctx, "browser prefs", line)?;
                let value = match tok.next_token()? {
                    Token::Word(w) => PrefValue::Text(match ctx {
                        Some(c) => c.substitute_word(&w),
                        None => w,
                    }),
                    Token::Quoted(s) => PrefValue::Text(match ctx {
                        Some(c) => c.substitute_string(&s),
                        None => s,
                    }),
                    Token::Number(n) => PrefValue::Number(n),
                    other => {
                        return Err(Error::Syntax(format!(
                            "browser prefs requires a value, found {} at line {line}",
                            other.describe()
                        )));
                    }
                };
                self.trace(source, line, &format!("browser prefs {pref} {value}"));
                if !self.flow.skip {
                    self.config.set_pref(pref, value);
                }
                Ok(())
            }
            "option" => {
                let option = self.next_text(tok, ctx, "browser option", line)?;
                self.trace(source, line, &format!("browser option {option}"));
                if !self.flow.skip {
                    self.config.args.push(option);
                }
                Ok(())
            }
            "chrome" => {
                let path = self.next_text(tok, ctx, "browser chrome", line)?;
                self.trace(source, line, &format!("browser chrome {path}"));
                if !self.flow.skip {
                    self.config.binary = Some(path);
                }
                Ok(())
            }
            "start" => {
                self.trace(source, line, "browser start");
                if self.flow.skip || self.session.is_some() {
                    return Ok(());
                }
                let session = (self.factory)(&self.config)
                    .map_err(|err| Error::Driver(format!("browser start: {err}")))?;
                self.session = Some(session);
                Ok(())
            }
            "get" => {
                let url = self.next_text(tok, ctx, "browser get", line)?;
                self.trace(source, line, &format!("browser get {url}"));
                if self.flow.skip {
                    return Ok(());
                }
                self.session_mut()?
                    .navigate(&url)
                    .map_err(|err| Error::Driver(format!("browser get {url}: {err}")))
            }
            "close" => {
                self.trace(source, line, "browser close");
                if self.flow.skip {
                    return Ok(());
                }
                self.session_mut()?
                    .close()
                    .map_err(|err| Error::Driver(format!("browser close: {err}")))?;
                self.autolog = false;
                Ok(())
            }
            "size" => {
                let w = self.next_number(tok, ctx, "browser size", line)?;
                self.expect_punct(tok, ',', "browser size", line)?;
                let h = self.next_number(tok, ctx, "browser size", line)?;
                self.trace(
                    source,
                    line,
                    &format!("browser size {},{}", number_text(w), number_text(h)),
                );
                if self.flow.skip {
                    return Ok(());
                }
                self.session_mut()?
                    .set_window_size(w as i32, h as i32)
                    .map_err(|err| Error::Driver(format!("browser size: {err}")))
            }
            "pos" => {
                let x = self.next_number(tok, ctx, "browser pos", line)?;
                self.expect_punct(tok, ',', "browser pos", line)?;
                let y = self.next_number(tok, ctx, "browser pos", line)?;
                self.trace(
                    source,
                    line,
                    &format!("browser pos {},{}", number_text(x), number_text(y)),
                );
                if self.flow.skip {
                    return Ok(());
                }
                self.session_mut()?
                    .set_window_position(x as i32, y as i32)
                    .map_err(|err| Error::Driver(format!("browser pos: {err}")))
            }
            other => Err(Error::Syntax(format!(
                "browser: unknown subcommand `{other}` at line {line}"
            ))),
        }
    }

    fn cmd_alias(&mut self, tok: &mut Tokenizer, source: &str, line: u32) -> Result<()> {
        let name = self.next_word_raw(tok, "alias", line)?;
        let Some(body) = read_block(tok, ' ', false)? else {
            return Err(Error::Syntax(format!(
                "alias {name} requires a body block at line {line}"
            )));
        };
        self.trace(source, line, &format!("alias {name} {{ ... }}"));
        if !self.flow.skip {
            self.functions.insert(name, ExecutionContext::alias(body));
        }
        Ok(())
    }

    fn cmd_function(&mut self, tok: &mut Tokenizer, source: &str, line: u32) -> Result<()> {
        let name = self.next_word_raw(tok, "function", line)?;
        let params = read_params(tok)?;
        let Some(body) = read_block(tok, ' ', false)? else {
            return Err(Error::Syntax(format!(
                "function {name} requires a body block at line {line}"
            )));
        };
        let signature = match &params {
            Some(list) => format!("({})", list.join(", ")),
            None => String::new(),
        };
        self.trace(source, line, &format!("function {name}{signature} {{ ... }}"));
        if !self.flow.skip {
            self.functions
                .insert(name, ExecutionContext::function(params, body));
        }
        Ok(())
    }

    fn cmd_while(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let Some(body) = read_block(tok, ' ', false)? else {
            return Err(Error::Syntax(format!(
                "while requires a block at line {line}"
            )));
        };
        self.trace(source, line, "while { ... }");
        if self.flow.skip {
            return Ok(());
        }
        // Any error inside the body is the loop-exit signal, not a failure.
        while self.run_tokens("while", &body, ctx).is_ok() {}
        Ok(())
    }

    fn cmd_include(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let path = self.next_text(tok, ctx, "include", line)?;
        self.trace(source, line, &format!("include {path}"));
        if self.flow.skip {
            return Ok(());
        }
        let resolved = self.resolve_path(&path);
        self.run_file(&resolved)
    }

    fn cmd_exec(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
        feed_back: bool,
    ) -> Result<()> {
        let command = self.next_text(tok, ctx, "exec", line)?;
        let args = read_args_list(tok)?;
        let label = if feed_back { "exec-include" } else { "exec" };
        self.trace(source, line, &format!("{label} {command} {}", args.join(" ")));
        if self.flow.skip {
            return Ok(());
        }
        let path = self.resolve_path(&command);
        let output = std::process::Command::new(&path)
            .args(&args)
            .current_dir(&self.base_dir)
            .output()
            .map_err(|err| Error::Exec(format!("{label} {}: {err}", path.display())))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !feed_back {
            for out_line in stdout.lines() {
                self.trace_note(out_line);
            }
        }
        if !output.status.success() {
            return Err(Error::Exec(format!(
                "{label} command returned failure status {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        if feed_back && !stdout.is_empty() {
            self.run_tokens(&command, &stdout, ctx)?;
        }
        Ok(())
    }

    fn cmd_log(&mut self, tok: &mut Tokenizer, source: &str, line: u32) -> Result<()> {
        let action = self.next_word_raw(tok, "log", line)?;
        match action.as_str() {
            "dump" => {
                self.trace(source, line, "log dump");
                if !self.flow.skip && self.session.is_some() {
                    self.dump_console_log()?;
                }
                Ok(())
            }
            "auto" => {
                let onoff = self.next_word_raw(tok, "log auto", line)?;
                self.trace(source, line, &format!("log auto {onoff}"));
                if !self.flow.skip {
                    self.autolog = matches!(onoff.as_str(), "on" | "true");
                }
                Ok(())
            }
            other => Err(Error::Syntax(format!(
                "log: invalid action `{other}` at line {line}"
            ))),
        }
    }

    fn cmd_default(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let what = self.next_word_raw(tok, "default", line)?;
        if what != "wait" {
            return Err(Error::Syntax(format!(
                "default: unknown setting `{what}` at line {line}"
            )));
        }
        let seconds = self.next_number(tok, ctx, "default wait", line)?;
        self.trace(source, line, &format!("default wait {}", number_text(seconds)));
        if !self.flow.skip {
            self.flow.default_wait_ms = (seconds * 1000.0) as u64;
        }
        Ok(())
    }

    fn cmd_push_pop(
        &mut self,
        cmd: Command,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
    ) -> Result<()> {
        let name = self.next_word_raw(tok, "push/pop", line)?;
        let label = if cmd == Command::Push { "push" } else { "pop" };
        self.trace(source, line, &format!("{label} {name}"));
        if name != "wait" {
            return Err(Error::Syntax(format!(
                "{label}: unknown stack `{name}` at line {line}"
            )));
        }
        if self.flow.skip {
            return Ok(());
        }
        if cmd == Command::Push {
            self.stacks.push(&name, self.flow.wait_until);
        } else {
            let value = self.stacks.pop(&name).ok_or_else(|| {
                Error::StackUnderflow(format!("pop {name}: stack is empty at line {line}"))
            })?;
            self.flow.wait_until = value;
        }
        Ok(())
    }

    fn cmd_echo(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let text = self.next_text(tok, ctx, "echo", line)?;
        self.trace(source, line, &format!("echo {text}"));
        if !self.flow.skip {
            self.trace_note(&text);
        }
        Ok(())
    }

    fn cmd_resolve(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
        kind: SelectorKind,
        name: &str,
    ) -> Result<()> {
        let value = self.next_text(tok, ctx, name, line)?;
        self.trace(source, line, &format!("{name} \"{value}\""));
        if self.flow.skip {
            return Ok(());
        }
        let provenance = format!("{name} \"{value}\"");
        self.resolve_selection(kind, value, provenance, line)
    }

    fn cmd_wait(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let seconds = self.next_number(tok, ctx, "wait", line)?;
        self.trace(source, line, &format!("wait {}", number_text(seconds)));
        if !self.flow.skip {
            self.flow.wait_until = self.clock.now_ms() + (seconds * 1000.0) as u64;
        }
        Ok(())
    }

    fn cmd_set(
        &mut self,
        cmd: Command,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let name = if cmd == Command::Set { "set" } else { "send" };
        let text = self.next_text(tok, ctx, name, line)?;
        self.trace(source, line, &format!("{name} \"{text}\""));
        if self.flow.skip {
            return Ok(());
        }
        let clear_first = cmd == Command::Set;
        self.wait_for(name, line, true, move |_, element| {
            let Some(element) = element else {
                return Err(StepError::Retryable("// selection lost".into()));
            };
            let tag = element.tag_name()?;
            if !is_field_tag(&tag) {
                return Err(StepError::Fatal(Error::CommandFailed(format!(
                    "{name} cannot be used on a non-field selection at line {line}"
                ))));
            }
            if clear_first && tag != "select" {
                element.clear()?;
            }
            element.send_keys(&text)?;
            Ok(())
        })
    }

    fn cmd_check(
        &mut self,
        cmd: Command,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let checksum = cmd == Command::Checksum;
        let name = if checksum { "checksum" } else { "check" };
        let expected = self.next_text(tok, ctx, name, line)?;
        self.trace(source, line, &format!("{name} \"{expected}\""));
        if self.flow.skip {
            return Ok(());
        }
        let negate = self.flow.take_negate();
        self.wait_for(name, line, true, move |_, element| {
            let Some(element) = element else {
                return Err(StepError::Retryable("// selection lost".into()));
            };
            let tag = element.tag_name()?;
            let value = if is_field_tag(&tag) {
                element.attribute("value")?
            } else {
                Some(element.text()?)
            };
            let matched = value
                .as_deref()
                .is_some_and(|v| compare_strings(v, &expected, checksum));
            if matched != negate {
                Ok(())
            } else {
                Err(StepError::Retryable(match &value {
                    None => format!("// check fail: expected '{expected}' but value is missing"),
                    Some(v) => {
                        format!("// check fail: expected '{expected}' which does not match '{v}'")
                    }
                }))
            }
        })
    }

    fn cmd_click(&mut self, source: &str, line: u32) -> Result<()> {
        self.trace(source, line, "click");
        if self.flow.skip {
            return Ok(());
        }
        self.wait_for("click", line, true, |_, element| {
            let Some(element) = element else {
                return Err(StepError::Retryable("// selection lost".into()));
            };
            element.click()?;
            Ok(())
        })
    }

    fn cmd_scroll_into_view(&mut self, source: &str, line: u32) -> Result<()> {
        self.trace(source, line, "scroll-into-view");
        if !self.selection.is_resolved() {
            return Err(Error::Precondition(format!(
                "scroll-into-view requires a current selection at line {line}"
            )));
        }
        if self.flow.skip {
            return Ok(());
        }
        let result = {
            let (Some(session), Some(element)) = (
                self.session.as_deref_mut(),
                self.selection.handle.as_deref(),
            ) else {
                return Err(Error::Precondition(
                    "browser start must be used before interacting with the browser".into(),
                ));
            };
            session.scroll_into_view(element)
        };
        if let Err(err) = result {
            self.selection_diagnostics();
            return Err(Error::Driver(format!("scroll-into-view: {err} at line {line}")));
        }
        Ok(())
    }

    fn cmd_clear(&mut self, source: &str, line: u32) -> Result<()> {
        self.trace(source, line, "clear");
        let Some(element) = self.selection.handle.as_deref() else {
            return Err(Error::Precondition(format!(
                "clear requires a current selection at line {line}"
            )));
        };
        if self.flow.skip {
            return Ok(());
        }
        element
            .clear()
            .map_err(|err| Error::Driver(format!("clear: {err} at line {line}")))
    }

    fn cmd_call(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let name = self.next_text(tok, ctx, "call", line)?;
        let args = read_block(tok, ',', true)?.unwrap_or_default();
        self.trace(source, line, &format!("call {name} {{{args}}}"));
        if self.flow.skip {
            return Ok(());
        }
        let script = format!(
            "var result = window.RegressionTest.test('{name}',[{args}]); \
             arguments[arguments.length-1](result);"
        );
        let result = {
            let session = self.session_mut()?;
            session.execute_async_script(&script)
        }
        .map_err(|err| Error::Driver(format!("call {name}: {err} at line {line}")))?;
        if let ScriptValue::Element(handle) = result {
            self.selection = Selection {
                descriptor: SelectorDescriptor {
                    kind: SelectorKind::ScriptResult,
                    value: script,
                },
                provenance: format!("call \"{name}\""),
                handle: Some(handle),
            };
            self.flow.last_test = true;
            self.trace_note("// new selection from script result");
        }
        Ok(())
    }

    fn cmd_state_predicate(&mut self, cmd: Command, source: &str, line: u32) -> Result<()> {
        let name = match cmd {
            Command::Enabled => "enabled",
            Command::Selected => "selected",
            _ => "displayed",
        };
        self.trace(source, line, name);
        if self.flow.skip {
            return Ok(());
        }
        let negate = self.flow.take_negate();
        self.wait_for(name, line, true, move |_, element| {
            let Some(element) = element else {
                return Err(StepError::Retryable("// selection lost".into()));
            };
            let state = match cmd {
                Command::Enabled => element.is_enabled()?,
                Command::Selected => element.is_selected()?,
                _ => element.is_displayed()?,
            };
            if state != negate {
                Ok(())
            } else {
                Err(StepError::Retryable(format!("// {name} check failed")))
            }
        })
    }

    // `*` means "any x" here, kept from the original language surface.
    fn next_coordinate(
        &mut self,
        tok: &mut Tokenizer,
        ctx: Option<&ExecutionContext>,
        what: &str,
        line: u32,
    ) -> Result<Option<i32>> {
        match tok.next_token()? {
            Token::Punct('*') => Ok(None),
            other => {
                tok.push_back(other);
                Ok(Some(self.next_number(tok, ctx, what, line)? as i32))
            }
        }
    }

    fn cmd_at(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let x = self.next_coordinate(tok, ctx, "at", line)?;
        self.expect_punct(tok, ',', "at", line)?;
        let y = self.next_number(tok, ctx, "at", line)? as i32;
        let x_text = x.map_or("*".to_string(), |v| v.to_string());
        self.trace(source, line, &format!("at {x_text},{y}"));
        if self.flow.skip {
            return Ok(());
        }
        let negate = self.flow.take_negate();
        self.wait_for("at", line, true, move |_, element| {
            let Some(element) = element else {
                return Err(StepError::Retryable("// selection lost".into()));
            };
            let location = element.location()?;
            let matched = x.is_none_or(|x| location.x == x) && location.y == y;
            if matched != negate {
                Ok(())
            } else {
                Err(StepError::Retryable(format!(
                    "// at check failed, element is at {},{}",
                    location.x, location.y
                )))
            }
        })
    }

    fn cmd_size(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let min_width = self.next_coordinate(tok, ctx, "size", line)?;
        let mut max_width = min_width;
        let mut range_text = min_width.map_or("*".to_string(), |v| v.to_string());
        match tok.next_token()? {
            Token::Punct(':') => {
                let w = self.next_number(tok, ctx, "size", line)? as i32;
                max_width = Some(w);
                range_text = format!("{range_text}:{w}");
            }
            other => tok.push_back(other),
        }
        self.expect_punct(tok, ',', "size", line)?;
        let height = self.next_number(tok, ctx, "size", line)? as i32;
        self.trace(source, line, &format!("size {range_text},{height}"));
        if self.flow.skip {
            return Ok(());
        }
        let negate = self.flow.take_negate();
        self.wait_for("size", line, true, move |_, element| {
            let Some(element) = element else {
                return Err(StepError::Retryable("// selection lost".into()));
            };
            let size = element.size()?;
            let width_ok = match (min_width, max_width) {
                (Some(min), Some(max)) => size.width >= min && size.width <= max,
                _ => true,
            };
            let matched = width_ok && size.height == height;
            if matched != negate {
                Ok(())
            } else {
                Err(StepError::Retryable(format!(
                    "// size check failed, element is {}x{}",
                    size.width, size.height
                )))
            }
        })
    }

    fn cmd_tag(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let expected = self.next_text(tok, ctx, "tag", line)?;
        self.trace(source, line, &format!("tag {expected}"));
        if self.flow.skip {
            return Ok(());
        }
        let negate = self.flow.take_negate();
        self.wait_for("tag", line, true, move |_, element| {
            let Some(element) = element else {
                return Err(StepError::Retryable("// selection lost".into()));
            };
            let tag = element.tag_name()?;
            if (tag == expected) != negate {
                Ok(())
            } else {
                Err(StepError::Retryable(format!(
                    "// tag check failed, tag is {tag}"
                )))
            }
        })
    }

    fn cmd_info(&mut self, source: &str, line: u32) -> Result<()> {
        self.trace(source, line, "info");
        if self.flow.skip {
            return Ok(());
        }
        let provenance = self.selection.provenance.clone();
        let mut rendered: Option<String> = None;
        self.wait_for("info", line, true, |_, element| {
            let Some(element) = element else {
                return Err(StepError::Retryable("// selection lost".into()));
            };
            rendered = Some(element_info_line(element, &provenance)?);
            Ok(())
        })?;
        if let Some(info) = rendered {
            self.trace_note(&info);
        }
        Ok(())
    }

    fn cmd_alert(&mut self, tok: &mut Tokenizer, source: &str, line: u32) -> Result<()> {
        let action = self.next_word_raw(tok, "alert", line)?;
        if action != "accept" {
            return Err(Error::Syntax(format!(
                "alert: unknown action `{action}` at line {line}"
            )));
        }
        self.trace(source, line, "alert accept");
        if self.flow.skip {
            return Ok(());
        }
        self.session_mut()?
            .accept_alert()
            .map_err(|err| Error::Driver(format!("alert accept: {err} at line {line}")))
    }

    fn cmd_dump(&mut self, source: &str, line: u32) -> Result<()> {
        self.trace(source, line, "dump");
        if self.flow.skip {
            return Ok(());
        }
        let elements = {
            let session = self.session_mut()?;
            session
                .find_elements(&Locator::XPath("//*[@test-id]".into()))
                .map_err(|err| Error::Driver(format!("dump: {err}")))?
        };
        for element in &elements {
            let provenance = element
                .attribute("test-id")
                .ok()
                .flatten()
                .map(|id| format!("test-id \"{id}\""))
                .unwrap_or_else(|| "test-id \"?\"".into());
            // Elements going stale mid-dump are skipped, not fatal.
            if let Ok(info) = element_info_line(element.as_ref(), &provenance) {
                self.trace_note(&info);
            }
        }
        Ok(())
    }

    fn cmd_mouse(&mut self, tok: &mut Tokenizer, source: &str, line: u32) -> Result<()> {
        let args = read_args_list(tok)?;
        self.trace(source, line, &format!("mouse {}", args.join(" ")));
        if self.flow.skip {
            return Ok(());
        }
        let mut actions = Vec::new();
        let mut pending: Option<i32> = None;
        for arg in &args {
            match arg.as_str() {
                "center" => actions.push(MouseAction::ToSelection),
                "origin" => actions.push(MouseAction::ToSelectionOrigin),
                "body" => actions.push(MouseAction::ToBody),
                "down" => actions.push(MouseAction::Down),
                "up" => actions.push(MouseAction::Up),
                "click" => actions.push(MouseAction::Click),
                other => {
                    if let Ok(n) = other.parse::<f64>() {
                        match pending.take() {
                            None => pending = Some(n as i32),
                            Some(x) => actions.push(MouseAction::ByOffset(x, n as i32)),
                        }
                    }
                }
            }
        }
        actions.push(MouseAction::Up);
        let result = {
            let Some(session) = self.session.as_deref_mut() else {
                return Err(Error::Precondition(
                    "browser start must be used before interacting with the browser".into(),
                ));
            };
            session.perform_mouse(&actions, self.selection.handle.as_deref())
        };
        result.map_err(|err| Error::Driver(format!("mouse: {err} at line {line}")))
    }

    fn cmd_sleep(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let seconds = self.next_number(tok, ctx, "sleep", line)?;
        self.trace(source, line, &format!("sleep {}", number_text(seconds)));
        if !self.flow.skip {
            self.clock.sleep_ms((seconds * 1000.0) as u64);
        }
        Ok(())
    }

    fn cmd_fail(
        &mut self,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let text = self.next_text(tok, ctx, "fail", line)?;
        self.trace(source, line, &format!("fail {text}"));
        if self.flow.skip {
            return Ok(());
        }
        self.trace_note(&format!("TEST FAIL: {text}"));
        Err(Error::ScriptFailure(text))
    }

    // ---- function/alias invocation ----------------------------------------

    fn invoke(
        &mut self,
        name: &str,
        tok: &mut Tokenizer,
        source: &str,
        line: u32,
        ctx: Option<&ExecutionContext>,
    ) -> Result<()> {
        let Some(mut callee) = self.functions.get(name).cloned() else {
            return Err(Error::UnrecognizedCommand(format!(
                "{name} at line {line} of {source}"
            )));
        };
        let count = callee.param_count();
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            match tok.next_token()? {
                Token::Number(n) => values.push(Value::Number(n)),
                Token::Word(w) => values.push(Value::Text(match ctx {
                    Some(c) => c.substitute_word(&w),
                    None => w,
                })),
                Token::Quoted(s) => values.push(Value::Text(match ctx {
                    Some(c) => c.substitute_string(&s),
                    None => s,
                })),
                Token::Punct(',') => {}
                other => {
                    return Err(Error::Syntax(format!(
                        "{name} expects {count} arguments, found {} at line {line}",
                        other.describe()
                    )));
                }
            }
        }
        let rendered: Vec<String> = values.iter().map(Value::to_string).collect();
        if rendered.is_empty() {
            self.trace(source, line, name);
        } else {
            self.trace(source, line, &format!("{name} {}", rendered.join(" ")));
        }
        if self.flow.skip {
            return Ok(());
        }
        callee.bind(values);
        let body = callee.body.clone();
        stacker::grow(32 * 1024 * 1024, || {
            self.run_tokens(name, &body, Some(&callee))
        })
    }
}
