use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Outcome bitmask of one run of the worker loop.
///
/// The raw bits double as the process exit code of the `crawler run` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CliStatus(u8);

impl CliStatus {
    pub const NOTHING_PROCESSED: CliStatus = CliStatus(0);
    /// Due entries are still left in the queue
    pub const REMAIN: CliStatus = CliStatus(1);
    pub const PROCESSED: CliStatus = CliStatus(2);
    pub const ABORTED: CliStatus = CliStatus(4);
    pub const POLLABLE_PROCESSED: CliStatus = CliStatus(8);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: CliStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CliStatus {
    type Output = CliStatus;

    fn bitor(self, rhs: CliStatus) -> CliStatus {
        CliStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for CliStatus {
    fn bitor_assign(&mut self, rhs: CliStatus) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CliStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "nothing processed");
        }

        let names = [
            (CliStatus::REMAIN, "remain"),
            (CliStatus::PROCESSED, "processed"),
            (CliStatus::ABORTED, "aborted"),
            (CliStatus::POLLABLE_PROCESSED, "pollable processed"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join(", "))
    }
}
