use std::fmt;

/// Exit codes of the interactive console-bootstrap helper (GRUB navigation
/// and ONIE install detection happen out of process; the harness only
/// interprets the code).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapExit {
    Usage,
    Login,
    Install,
    MissingBinary,
    Unknown,
}

impl BootstrapExit {
    pub fn code(&self) -> i32 {
        match self {
            BootstrapExit::Usage => 1,
            BootstrapExit::Login => 2,
            BootstrapExit::Install => 3,
            BootstrapExit::MissingBinary => 4,
            BootstrapExit::Unknown => 5,
        }
    }
}

impl From<i32> for BootstrapExit {
    fn from(code: i32) -> Self {
        match code {
            1 => BootstrapExit::Usage,
            2 => BootstrapExit::Login,
            3 => BootstrapExit::Install,
            4 => BootstrapExit::MissingBinary,
            _ => BootstrapExit::Unknown,
        }
    }
}

impl fmt::Display for BootstrapExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BootstrapExit::Usage => "usage error",
            BootstrapExit::Login => "login failed",
            BootstrapExit::Install => "install failed",
            BootstrapExit::MissingBinary => "helper binary missing",
            BootstrapExit::Unknown => "unknown failure",
        };
        f.write_str(text)
    }
}
