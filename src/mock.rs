//! Deterministic in-memory test doubles: a virtual clock, a scriptable fake
//! browser session, and a shared trace buffer. Everything here is
//! single-threaded by construction.

use super::*;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::rc::Rc;

/// Virtual clock. `sleep_ms` advances time instead of blocking, so retry
/// loops run to their deadline instantly and deterministically.
#[derive(Clone)]
pub struct MockClock {
    now: Rc<Cell<u64>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
        }
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

/// Builder for one fake page element.
#[derive(Debug, Clone)]
pub struct MockElement {
    tag: String,
    test_id: Option<String>,
    css: Option<String>,
    xpath: Option<String>,
    value: String,
    text: String,
    displayed: bool,
    enabled: bool,
    selected: bool,
    location: Point,
    size: Size,
    appears_at_ms: u64,
}

impl MockElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            test_id: None,
            css: None,
            xpath: None,
            value: String::new(),
            text: String::new(),
            displayed: true,
            enabled: true,
            selected: false,
            location: Point::default(),
            size: Size::default(),
            appears_at_ms: 0,
        }
    }

    pub fn test_id(mut self, id: &str) -> Self {
        self.test_id = Some(id.to_string());
        self
    }

    pub fn css(mut self, selector: &str) -> Self {
        self.css = Some(selector.to_string());
        self
    }

    pub fn xpath(mut self, expr: &str) -> Self {
        self.xpath = Some(expr.to_string());
        self
    }

    pub fn value(mut self, value: &str) -> Self {
        self.value = value.to_string();
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn displayed(mut self, displayed: bool) -> Self {
        self.displayed = displayed;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn selected(mut self, selected: bool) -> Self {
        self.selected = selected;
        self
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.location = Point { x, y };
        self
    }

    pub fn sized(mut self, width: i32, height: i32) -> Self {
        self.size = Size { width, height };
        self
    }

    /// The element is invisible to lookups before this virtual timestamp,
    /// which is how tests model content that renders late.
    pub fn appears_at(mut self, ms: u64) -> Self {
        self.appears_at_ms = ms;
        self
    }

    fn label(&self) -> String {
        self.test_id.clone().unwrap_or_else(|| self.tag.clone())
    }
}

struct ElementRecord {
    props: MockElement,
    generation: u32,
}

/// One queued result for `execute_async_script`.
pub enum MockScriptOutcome {
    Null,
    Text(String),
    Element(usize),
}

#[derive(Default)]
struct MockState {
    elements: Vec<ElementRecord>,
    journal: Vec<String>,
    console: Vec<LogEntry>,
    fail_interactions: VecDeque<DriverError>,
    script_results: VecDeque<MockScriptOutcome>,
    alert_open: bool,
}

/// Test-side handle onto the fake page shared with a [`MockDriver`]. Lets a
/// test seed elements, inject failures, and inspect what the interpreter did.
#[derive(Clone)]
pub struct MockPage {
    state: Rc<RefCell<MockState>>,
}

impl MockPage {
    pub fn add(&self, element: MockElement) -> usize {
        let mut state = self.state.borrow_mut();
        state.elements.push(ElementRecord {
            props: element,
            generation: 0,
        });
        state.elements.len() - 1
    }

    pub fn journal(&self) -> Vec<String> {
        self.state.borrow().journal.clone()
    }

    pub fn value_of(&self, id: usize) -> String {
        self.state.borrow().elements[id].props.value.clone()
    }

    pub fn set_value(&self, id: usize, value: &str) {
        self.state.borrow_mut().elements[id].props.value = value.to_string();
    }

    pub fn set_text(&self, id: usize, text: &str) {
        self.state.borrow_mut().elements[id].props.text = text.to_string();
    }

    /// Invalidates all handles to this element. Existing handles report
    /// stale; a fresh lookup returns a live one.
    pub fn invalidate(&self, id: usize) {
        self.state.borrow_mut().elements[id].generation += 1;
    }

    /// Queues one failure returned by the next element interaction, whatever
    /// it is. Queued failures are consumed in order.
    pub fn fail_next_interaction(&self, err: DriverError) {
        self.state.borrow_mut().fail_interactions.push_back(err);
    }

    pub fn push_console(&self, level: LogLevel, message: &str) {
        self.state.borrow_mut().console.push(LogEntry {
            level,
            message: message.to_string(),
        });
    }

    pub fn queue_script_result(&self, outcome: MockScriptOutcome) {
        self.state.borrow_mut().script_results.push_back(outcome);
    }

    pub fn open_alert(&self) {
        self.state.borrow_mut().alert_open = true;
    }

    pub fn alert_open(&self) -> bool {
        self.state.borrow().alert_open
    }
}

struct MockHandle {
    state: Rc<RefCell<MockState>>,
    index: usize,
    generation: u32,
}

impl MockHandle {
    fn check(&self) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.fail_interactions.pop_front() {
            return Err(err);
        }
        if state.elements[self.index].generation != self.generation {
            return Err(DriverError::Stale);
        }
        Ok(())
    }

    fn with_props<T>(&self, f: impl FnOnce(&MockElement) -> T) -> DriverResult<T> {
        self.check()?;
        Ok(f(&self.state.borrow().elements[self.index].props))
    }
}

impl Element for MockHandle {
    fn click(&self) -> DriverResult<()> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        let label = state.elements[self.index].props.label();
        state.journal.push(format!("click {label}"));
        Ok(())
    }

    fn clear(&self) -> DriverResult<()> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        let label = state.elements[self.index].props.label();
        state.elements[self.index].props.value.clear();
        state.journal.push(format!("clear {label}"));
        Ok(())
    }

    fn send_keys(&self, text: &str) -> DriverResult<()> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        let label = state.elements[self.index].props.label();
        state.elements[self.index].props.value.push_str(text);
        state.journal.push(format!("keys {label}:{text}"));
        Ok(())
    }

    fn attribute(&self, name: &str) -> DriverResult<Option<String>> {
        self.with_props(|props| match name {
            "value" => Some(props.value.clone()),
            "test-id" => props.test_id.clone(),
            _ => None,
        })
    }

    fn text(&self) -> DriverResult<String> {
        self.with_props(|props| props.text.clone())
    }

    fn tag_name(&self) -> DriverResult<String> {
        self.with_props(|props| props.tag.clone())
    }

    fn is_displayed(&self) -> DriverResult<bool> {
        self.with_props(|props| props.displayed)
    }

    fn is_enabled(&self) -> DriverResult<bool> {
        self.with_props(|props| props.enabled)
    }

    fn is_selected(&self) -> DriverResult<bool> {
        self.with_props(|props| props.selected)
    }

    fn location(&self) -> DriverResult<Point> {
        self.with_props(|props| props.location)
    }

    fn size(&self) -> DriverResult<Size> {
        self.with_props(|props| props.size)
    }
}

/// Fake browser session backed by the shared page state and a virtual clock.
pub struct MockDriver {
    state: Rc<RefCell<MockState>>,
    clock: MockClock,
}

impl MockDriver {
    fn visible(&self, record: &ElementRecord) -> bool {
        record.props.appears_at_ms <= self.clock.now()
    }

    fn matches(props: &MockElement, locator: &Locator) -> bool {
        match locator {
            Locator::Css(selector) => props.css.as_deref() == Some(selector),
            Locator::XPath(expr) => {
                if expr == "//*[@test-id]" {
                    return props.test_id.is_some();
                }
                if let Some(id) = expr
                    .strip_prefix("//*[@test-id='")
                    .and_then(|rest| rest.strip_suffix("']"))
                {
                    return props.test_id.as_deref() == Some(id);
                }
                props.xpath.as_deref() == Some(expr)
            }
        }
    }

    fn handle(&self, index: usize) -> Box<dyn Element> {
        let generation = self.state.borrow().elements[index].generation;
        Box::new(MockHandle {
            state: self.state.clone(),
            index,
            generation,
        })
    }

    fn find_indexes(&self, locator: &Locator) -> Vec<usize> {
        self.state
            .borrow()
            .elements
            .iter()
            .enumerate()
            .filter(|(_, record)| self.visible(record) && Self::matches(&record.props, locator))
            .map(|(index, _)| index)
            .collect()
    }
}

impl Driver for MockDriver {
    fn navigate(&mut self, url: &str) -> DriverResult<()> {
        self.state
            .borrow_mut()
            .journal
            .push(format!("navigate {url}"));
        Ok(())
    }

    fn find_element(&mut self, locator: &Locator) -> DriverResult<Box<dyn Element>> {
        match self.find_indexes(locator).first() {
            Some(&index) => Ok(self.handle(index)),
            None => Err(DriverError::NotFound(locator.to_string())),
        }
    }

    fn find_elements(&mut self, locator: &Locator) -> DriverResult<Vec<Box<dyn Element>>> {
        Ok(self
            .find_indexes(locator)
            .into_iter()
            .map(|index| self.handle(index))
            .collect())
    }

    fn execute_script(&mut self, js: &str) -> DriverResult<ScriptValue> {
        self.execute_async_script(js)
    }

    fn execute_async_script(&mut self, js: &str) -> DriverResult<ScriptValue> {
        let outcome = {
            let mut state = self.state.borrow_mut();
            state.journal.push(format!("script {js}"));
            state.script_results.pop_front()
        };
        Ok(match outcome {
            None | Some(MockScriptOutcome::Null) => ScriptValue::Null,
            Some(MockScriptOutcome::Text(text)) => ScriptValue::Text(text),
            Some(MockScriptOutcome::Element(index)) => ScriptValue::Element(self.handle(index)),
        })
    }

    fn scroll_into_view(&mut self, element: &dyn Element) -> DriverResult<()> {
        let label = element
            .attribute("test-id")?
            .unwrap_or_else(|| element.tag_name().unwrap_or_default());
        self.state
            .borrow_mut()
            .journal
            .push(format!("scroll {label}"));
        Ok(())
    }

    fn set_window_size(&mut self, width: i32, height: i32) -> DriverResult<()> {
        self.state
            .borrow_mut()
            .journal
            .push(format!("window size {width}x{height}"));
        Ok(())
    }

    fn set_window_position(&mut self, x: i32, y: i32) -> DriverResult<()> {
        self.state
            .borrow_mut()
            .journal
            .push(format!("window pos {x},{y}"));
        Ok(())
    }

    fn accept_alert(&mut self) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.alert_open {
            return Err(DriverError::NoAlert);
        }
        state.alert_open = false;
        state.journal.push("alert accept".to_string());
        Ok(())
    }

    fn perform_mouse(
        &mut self,
        actions: &[MouseAction],
        selection: Option<&dyn Element>,
    ) -> DriverResult<()> {
        let target = match selection {
            Some(element) => element.attribute("test-id")?.unwrap_or_default(),
            None => String::new(),
        };
        self.state
            .borrow_mut()
            .journal
            .push(format!("mouse {target} {actions:?}"));
        Ok(())
    }

    fn console_log(&mut self) -> DriverResult<Vec<LogEntry>> {
        Ok(std::mem::take(&mut self.state.borrow_mut().console))
    }

    fn close(&mut self) -> DriverResult<()> {
        self.state.borrow_mut().journal.push("close".to_string());
        Ok(())
    }

    fn quit(&mut self) -> DriverResult<()> {
        self.state.borrow_mut().journal.push("quit".to_string());
        Ok(())
    }
}

/// Builds a fake session and the test handle sharing its page state.
pub fn mock_session(clock: &MockClock) -> (MockDriver, MockPage) {
    let state = Rc::new(RefCell::new(MockState::default()));
    (
        MockDriver {
            state: state.clone(),
            clock: clock.clone(),
        },
        MockPage { state },
    )
}

/// Driver factory that hands out the given session once. A second
/// `browser start` in the same test is a session error.
pub fn single_session_factory(driver: MockDriver) -> DriverFactory {
    let mut slot = Some(driver);
    Box::new(move |_config| {
        slot.take()
            .map(|driver| Box::new(driver) as Box<dyn Driver>)
            .ok_or_else(|| DriverError::Session("mock session already started".into()))
    })
}

/// Clonable in-memory `Write` sink for capturing the interpreter trace.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Rc<RefCell<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
