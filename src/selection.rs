use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    None,
    FieldId,
    CssSelect,
    XPath,
    ScriptResult,
}

/// The replayable (kind, value) pair behind the current selection. For
/// `ScriptResult` the value is the injected script text that must be re-run
/// to reselect; for `FieldId` it is the bare test-id attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorDescriptor {
    pub kind: SelectorKind,
    pub value: String,
}

impl SelectorDescriptor {
    pub fn none() -> Self {
        Self {
            kind: SelectorKind::None,
            value: String::new(),
        }
    }

    /// Driver locator for selector kinds that resolve through element
    /// lookup. `None` for the empty descriptor and for script results.
    pub fn locator(&self) -> Option<Locator> {
        match self.kind {
            SelectorKind::FieldId => Some(Locator::XPath(format!(
                "//*[@test-id='{}']",
                self.value
            ))),
            SelectorKind::CssSelect => Some(Locator::Css(self.value.clone())),
            SelectorKind::XPath => Some(Locator::XPath(self.value.clone())),
            SelectorKind::None | SelectorKind::ScriptResult => None,
        }
    }
}

/// The single current selection: element handle, replayable descriptor, and
/// a human-readable provenance string for diagnostics. Exactly one selection
/// is live at a time; resolving a new one replaces it.
pub struct Selection {
    pub descriptor: SelectorDescriptor,
    pub provenance: String,
    pub handle: Option<Box<dyn Element>>,
}

impl Selection {
    pub fn empty() -> Self {
        Self {
            descriptor: SelectorDescriptor::none(),
            provenance: String::new(),
            handle: None,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    pub fn is_resolved(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_descriptor_builds_test_id_xpath() {
        let descriptor = SelectorDescriptor {
            kind: SelectorKind::FieldId,
            value: "user".into(),
        };
        assert_eq!(
            descriptor.locator(),
            Some(Locator::XPath("//*[@test-id='user']".into()))
        );
    }

    #[test]
    fn css_and_xpath_descriptors_pass_value_through() {
        let css = SelectorDescriptor {
            kind: SelectorKind::CssSelect,
            value: "#login".into(),
        };
        assert_eq!(css.locator(), Some(Locator::Css("#login".into())));

        let xpath = SelectorDescriptor {
            kind: SelectorKind::XPath,
            value: "//div[@x]".into(),
        };
        assert_eq!(xpath.locator(), Some(Locator::XPath("//div[@x]".into())));
    }

    #[test]
    fn empty_and_script_descriptors_have_no_locator() {
        assert_eq!(SelectorDescriptor::none().locator(), None);
        let script = SelectorDescriptor {
            kind: SelectorKind::ScriptResult,
            value: "return 1;".into(),
        };
        assert_eq!(script.locator(), None);
    }
}
