use super::*;
use std::thread;
use std::time::{Duration, Instant};

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Failure classes reported by the browser-automation collaborator. The
/// retry engine keys its recovery decisions off these variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    NotFound(String),
    Stale,
    InvalidState(String),
    Script(String),
    NoAlert,
    Session(String),
    Other(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "no such element: {what}"),
            Self::Stale => write!(f, "stale element reference"),
            Self::InvalidState(msg) => write!(f, "invalid element state: {msg}"),
            Self::Script(msg) => write!(f, "script error: {msg}"),
            Self::NoAlert => write!(f, "no alert open"),
            Self::Session(msg) => write!(f, "session error: {msg}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl StdError for DriverError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css `{s}`"),
            Self::XPath(s) => write!(f, "xpath `{s}`"),
        }
    }
}

/// Result of an injected script. Only element results are interesting to the
/// interpreter (they replace the current selection).
pub enum ScriptValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Element(Box<dyn Element>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Severe,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Severe => write!(f, "SEVERE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseAction {
    ToSelection,
    ToSelectionOrigin,
    ToBody,
    Down,
    Up,
    Click,
    ByOffset(i32, i32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrefValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for PrefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(t) => write!(f, "{t}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Browser launch configuration accumulated by `browser prefs/option/chrome`
/// before `browser start` hands it to the driver factory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowserConfig {
    pub prefs: Vec<(String, PrefValue)>,
    pub args: Vec<String>,
    pub binary: Option<String>,
}

impl BrowserConfig {
    pub fn set_pref(&mut self, name: String, value: PrefValue) {
        self.prefs.retain(|(existing, _)| *existing != name);
        self.prefs.push((name, value));
    }
}

/// Handle to one resolved page element.
pub trait Element {
    fn click(&self) -> DriverResult<()>;
    fn clear(&self) -> DriverResult<()>;
    fn send_keys(&self, text: &str) -> DriverResult<()>;
    fn attribute(&self, name: &str) -> DriverResult<Option<String>>;
    fn text(&self) -> DriverResult<String>;
    fn tag_name(&self) -> DriverResult<String>;
    fn is_displayed(&self) -> DriverResult<bool>;
    fn is_enabled(&self) -> DriverResult<bool>;
    fn is_selected(&self) -> DriverResult<bool>;
    fn location(&self) -> DriverResult<Point>;
    fn size(&self) -> DriverResult<Size>;
}

/// Capability set the interpreter needs from a browser session. Any
/// WebDriver-equivalent client can implement this out-of-tree; the in-crate
/// [`mock::MockDriver`](crate::mock::MockDriver) implements it for tests.
pub trait Driver {
    fn navigate(&mut self, url: &str) -> DriverResult<()>;
    fn find_element(&mut self, locator: &Locator) -> DriverResult<Box<dyn Element>>;
    fn find_elements(&mut self, locator: &Locator) -> DriverResult<Vec<Box<dyn Element>>>;
    fn execute_script(&mut self, js: &str) -> DriverResult<ScriptValue>;
    fn execute_async_script(&mut self, js: &str) -> DriverResult<ScriptValue>;
    fn scroll_into_view(&mut self, element: &dyn Element) -> DriverResult<()>;
    fn set_window_size(&mut self, width: i32, height: i32) -> DriverResult<()>;
    fn set_window_position(&mut self, x: i32, y: i32) -> DriverResult<()>;
    fn accept_alert(&mut self) -> DriverResult<()>;
    fn perform_mouse(
        &mut self,
        actions: &[MouseAction],
        selection: Option<&dyn Element>,
    ) -> DriverResult<()>;
    fn console_log(&mut self) -> DriverResult<Vec<LogEntry>>;
    fn close(&mut self) -> DriverResult<()>;
    fn quit(&mut self) -> DriverResult<()>;
}

/// Creates a driver session from the accumulated launch configuration when
/// the script reaches `browser start`.
pub type DriverFactory = Box<dyn FnMut(&BrowserConfig) -> DriverResult<Box<dyn Driver>>>;

/// Time source for deadlines and retry pacing. The interpreter never reads
/// the OS clock directly, which keeps retry behavior deterministic under the
/// mock clock in tests.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}
