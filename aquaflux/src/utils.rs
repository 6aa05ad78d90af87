/// Serde helpers shared by the config structs.
pub mod serialise;
/// Test helpers for locating fixture files.
pub mod tests;
