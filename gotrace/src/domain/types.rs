//! Domain types providing compile-time safety and self-documentation

use std::fmt;

/// Process ID of the traced target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    fn from(pid: i32) -> Self {
        Pid(pid)
    }
}

impl Pid {
    /// `/proc/<pid>` still exists
    #[must_use]
    pub fn is_alive(self) -> bool {
        std::path::Path::new(&format!("/proc/{}", self.0)).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid(42).to_string(), "PID:42");
    }

    #[test]
    #[allow(clippy::cast_possible_wrap)]
    fn test_own_process_is_alive() {
        assert!(Pid(std::process::id() as i32).is_alive());
        assert!(!Pid(999_999_999).is_alive());
    }
}
