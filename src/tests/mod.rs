#[cfg(test)]
pub mod bootstrap_tests;
