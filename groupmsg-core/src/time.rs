use std::time::SystemTime;

/// Current wall clock time
///
/// All wall clock reads go through here so they are easy to find.
pub fn now() -> SystemTime {
    SystemTime::now()
}

