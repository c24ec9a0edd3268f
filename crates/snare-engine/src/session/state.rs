use std::fmt;

/// Lifecycle state of a [Session](crate::Session).
///
/// ```text
/// Created -> Attaching -> Attached -> Verifying -> Verified -> PayloadLoading -> Active -> Detached
///                  \-> AttachFailed                  \-> VerifyFailed -> Detached
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// A candidate process was picked.
    Created,

    /// The backend is attaching to the process.
    Attaching,

    /// Attached, the target module is not confirmed yet.
    Attached,

    /// The loaded-module table is being queried.
    Verifying,

    /// The target module is loaded.
    Verified,

    /// The control channel is being opened.
    PayloadLoading,

    /// Hooks can be installed.
    Active,

    /// Detached from the process (terminal).
    Detached,

    /// Attaching failed (terminal).
    AttachFailed,

    /// The target module never showed up.
    VerifyFailed,
}

impl SessionState {
    /// Returns whether no operation is possible anymore in this state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Detached | Self::AttachFailed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::PayloadLoading => "loading payload",
            Self::Active => "active",
            Self::Detached => "detached",
            Self::AttachFailed => "attach failed",
            Self::VerifyFailed => "verify failed",
        };

        f.write_str(s)
    }
}
