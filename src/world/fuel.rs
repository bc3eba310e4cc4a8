//! Fuel for the machine

/// An instruction budget.
///
/// The evaluator burns one unit per instruction and stops with
/// [`RuntimeError::OutOfFuel`](crate::RuntimeError::OutOfFuel) once it is
/// spent.
#[derive(Debug, Clone)]
pub struct Fuel {
    fuel: i32,
}

impl Fuel {
    pub fn with(fuel: i32) -> Self {
        Self { fuel }
    }

    /// Subtract from the current remaining fuel.
    pub fn consume(&mut self, fuel: i32) {
        self.fuel = self.fuel.saturating_sub(fuel);
    }

    pub fn remaining(&self) -> i32 {
        self.fuel
    }

    /// Returns true if we have positive fuel remaining.
    pub fn should_continue(&self) -> bool {
        self.fuel > 0
    }
}
