pub mod adb;
pub use adb::{mock_adb, MockAdb, ScriptedAdb};
