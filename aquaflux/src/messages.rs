/// Standardise how messages are sent into and out of
/// the output daemon. Provide test suite to
/// ensure interfaces are respected.
pub mod control {
    /// Switch and status messages, one JSON object per line.
    pub mod switch;
}

/// Measurements written by the outputs and the sinks that store them.
pub mod measurement;
