//! Mutable translation state.

use super::operand::{Operand, StageRef};

/// Variables bound by one lambda scope.
#[derive(Debug, Clone)]
pub struct Binding {
    pub this: Operand,
    pub index: Option<Operand>,
    pub total: Option<Operand>,
}

impl Binding {
    pub fn this(this: Operand) -> Self {
        Self {
            this,
            index: None,
            total: None,
        }
    }
}

/// Translation context.
///
/// Cloned before translating a sub-expression and restored afterwards, so
/// nothing a lambda body binds is visible to the caller's continuation. The
/// name counters survive restores.
#[derive(Debug, Clone)]
pub struct Context {
    /// Stage most recently emitted.
    pub current_table: Option<String>,
    /// Steps of the JSON navigation in progress.
    pub current_json_path: Vec<String>,
    /// Implicit input of identifiers; `None` means the root resource.
    pub focus: Option<Operand>,
    /// Stage whose row inline SQL is evaluated against.
    pub row: Option<StageRef>,
    /// Translating inside a lambda body: results must stay expressions.
    pub inline: bool,
    bindings: Vec<Binding>,
    prefix: String,
    counter: usize,
    locals: usize,
}

impl Context {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            current_table: None,
            current_json_path: Vec::new(),
            focus: None,
            row: None,
            inline: false,
            bindings: Vec::new(),
            prefix: prefix.into(),
            counter: 0,
            locals: 0,
        }
    }

    /// Next CTE name.
    pub fn next_alias(&mut self) -> String {
        self.counter += 1;
        format!("{}_{}", self.prefix, self.counter)
    }

    /// Next subquery alias, unique within the statement.
    pub fn next_local(&mut self, stem: &str) -> String {
        self.locals += 1;
        format!("{stem}{}", self.locals)
    }

    pub fn save(&self) -> Context {
        self.clone()
    }

    /// Return to a saved state, keeping the name counters.
    pub fn restore(&mut self, saved: Context) {
        let (counter, locals) = (self.counter, self.locals);
        *self = saved;
        self.counter = counter;
        self.locals = locals;
    }

    /// Enter a lambda scope. The bound `$this` becomes the focus.
    pub fn bind(&mut self, binding: Binding) {
        self.focus = Some(binding.this.clone());
        self.bindings.push(binding);
    }

    pub fn this(&self) -> Option<&Operand> {
        self.bindings.last().map(|b| &b.this)
    }

    /// `$index` of the innermost scope only.
    pub fn index(&self) -> Option<&Operand> {
        self.bindings.last().and_then(|b| b.index.as_ref())
    }

    /// `$total` of the nearest scope binding it.
    pub fn total(&self) -> Option<&Operand> {
        self.bindings.iter().rev().find_map(|b| b.total.as_ref())
    }

    pub fn depth(&self) -> usize {
        self.bindings.len()
    }
}
