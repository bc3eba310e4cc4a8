//! Compile-time scopes.
use std::collections::HashMap;

use lasso::Spur;

/// Where a binding lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// a slot of the global table
    Global(usize),
    /// a local slot, relative to the frame's base
    Local(usize),
}

/// How a name is reached from the code referencing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Global(usize),
    Local(usize),
    /// an index into the running function's foreign table
    Foreign(usize),
}

/// A lexical scope.
///
/// Scopes live on a stack owned by the compiler and are popped in the
/// order they were pushed, so the parent is just an index below.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    names: HashMap<Spur, usize>,
    parent: Option<usize>,
    /// the function this scope belongs to, None at module scope
    function: Option<usize>,
}

impl Scope {
    /// The module scope, starting out with the given bindings.
    pub fn module(names: HashMap<Spur, usize>) -> Self {
        Self {
            names,
            parent: None,
            function: None,
        }
    }

    pub fn child(parent: usize, function: Option<usize>) -> Self {
        Self {
            names: HashMap::new(),
            parent: Some(parent),
            function,
        }
    }

    pub fn get(&self, name: Spur) -> Option<usize> {
        self.names.get(&name).copied()
    }

    /// Binds `name` in this scope, shadowing any previous binding here.
    pub fn define(&mut self, name: Spur, slot: usize) {
        self.names.insert(name, slot);
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn function(&self) -> Option<usize> {
        self.function
    }

    pub fn into_names(self) -> HashMap<Spur, usize> {
        self.names
    }
}

impl From<Storage> for Access {
    fn from(storage: Storage) -> Self {
        match storage {
            Storage::Global(slot) => Self::Global(slot),
            Storage::Local(slot) => Self::Local(slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Scope;
    use assert2::check;
    use lasso::Rodeo;

    #[test]
    fn scopes_shadow_and_chain() {
        let mut rodeo = Rodeo::default();
        let x = rodeo.get_or_intern("x");

        let mut module = Scope::module(Default::default());
        module.define(x, 4);
        check!(module.get(x) == Some(4));
        check!(module.function().is_none());
        module.define(x, 7);
        check!(module.get(x) == Some(7));

        let inner = Scope::child(0, Some(0));
        check!(inner.get(x).is_none());
        check!(inner.parent() == Some(0));
        check!(inner.function() == Some(0));
    }
}
