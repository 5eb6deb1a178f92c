use super::*;
use crate::tokenizer::number_text;

/// A value bound to a function parameter. Numbers stay numeric through the
/// call so `$I(name)` and numeric re-use keep their type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    /// Integer-truncated rendering, used by `$I(name)` substitution.
    pub fn integer_form(&self) -> String {
        match self {
            Self::Number(n) => format!("{}", n.trunc() as i64),
            Self::Text(t) => match t.parse::<f64>() {
                Ok(n) => format!("{}", n.trunc() as i64),
                Err(_) => t.clone(),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", number_text(*n)),
            Self::Text(t) => write!(f, "{t}"),
        }
    }
}

/// One invocable unit of script: an optional parameter list, the raw body
/// text, and the values bound for the current invocation.
///
/// Bodies stay strings and are re-tokenized on every call; binding is
/// positional. The function/alias table owns exactly one context per name and
/// redefinition replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub params: Option<Vec<String>>,
    pub body: String,
    args: Vec<Value>,
}

impl ExecutionContext {
    pub fn alias(body: String) -> Self {
        Self {
            params: None,
            body,
            args: Vec::new(),
        }
    }

    pub fn function(params: Option<Vec<String>>, body: String) -> Self {
        Self {
            params,
            body,
            args: Vec::new(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.params.as_ref().map_or(0, Vec::len)
    }

    /// Clears and repopulates the bound arguments for one invocation.
    pub fn bind(&mut self, values: Vec<Value>) {
        self.args = values;
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        let params = self.params.as_ref()?;
        let index = params.iter().position(|p| p == name)?;
        self.args.get(index)
    }

    /// Substitutes a bare word: `$name` becomes the bound value's string
    /// form, `\$name` drops the escape, anything else passes through.
    pub fn substitute_word(&self, word: &str) -> String {
        if let Some(rest) = word.strip_prefix('\\') {
            if rest.starts_with('$') {
                return rest.to_string();
            }
        }
        if let Some(name) = word.strip_prefix('$') {
            if let Some(value) = self.lookup(name) {
                return value.to_string();
            }
        }
        word.to_string()
    }

    /// Substitutes `$(name)` and `$I(name)` patterns inside a quoted string,
    /// in parameter-declaration order. Unmatched patterns stay verbatim.
    pub fn substitute_string(&self, text: &str) -> String {
        let Some(params) = &self.params else {
            return text.to_string();
        };
        let mut out = text.to_string();
        for (name, value) in params.iter().zip(&self.args) {
            out = out.replace(&format!("$({name})"), &value.to_string());
            out = out.replace(&format!("$I({name})"), &value.integer_form());
        }
        out
    }

    /// Numeric value of a bound `$name` reference, if the argument is a
    /// number. `None` means the caller should raise an argument type error.
    pub fn numeric_value(&self, word: &str) -> Option<f64> {
        let name = word.strip_prefix('$')?;
        self.lookup(name)?.as_number()
    }
}
