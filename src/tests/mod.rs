//! Scenario tests across modules.

#[cfg(test)]
mod dispatch_tests;
