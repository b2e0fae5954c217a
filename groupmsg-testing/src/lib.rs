//! Test doubles and fixtures for the group message queue

pub mod db;
pub mod fixtures;
pub mod mock;

pub use fixtures::{Fixtures, GroupMessage, test_config};
