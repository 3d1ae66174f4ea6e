// tests/property_test.rs

//! Property-based tests for the engine's core invariants: routing, barrier
//! safety, LSN monotonicity, journal framing, and checkpoint atomicity.

mod property {
    pub mod barrier_test;
    pub mod checkpoint_test;
    pub mod journal_test;
    pub mod routing_test;
}
