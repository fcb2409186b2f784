use std::fmt;

use crate::backend::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
    Info,
}

/// User-facing action names used in failure messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Load,
    Add,
    Update,
    Rename,
    Delete,
    AttachImage,
    DetachImage,
    SignIn,
    SignUp,
    ResetPassword,
    SignOut,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Action::Load => "load todos",
            Action::Add => "add todo",
            Action::Update => "update todo",
            Action::Rename => "rename todo",
            Action::Delete => "delete todo",
            Action::AttachImage => "attach image",
            Action::DetachImage => "remove image",
            Action::SignIn => "sign in",
            Action::SignUp => "sign up",
            Action::ResetPassword => "request password reset",
            Action::SignOut => "sign out",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Info,
            message: message.into(),
        }
    }

    /// Names the failed action and carries the underlying message and code
    pub fn action_failed(action: Action, error: &RemoteError) -> Self {
        Self::error(format!("Failed to {action}: {error}. Please try again."))
    }

    /// The todo exists but its image does not
    pub fn partial_create(text: &str, error: &RemoteError) -> Self {
        Self::error(format!(
            "Added \"{text}\", but the image could not be attached: {error}"
        ))
    }

    pub fn is_error(&self) -> bool {
        self.kind == NoticeKind::Error
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            NoticeKind::Success => "ok",
            NoticeKind::Error => "error",
            NoticeKind::Info => "info",
        };
        write!(f, "{prefix}: {}", self.message)
    }
}

/// Placeholder shown instead of an empty list
pub fn empty_list_hint(authenticated: bool) -> &'static str {
    if authenticated {
        "Nothing planned yet. Add your first todo!"
    } else {
        "Sign in to plan your todos."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_failed_names_action_and_code() {
        let notice = Notice::action_failed(Action::Delete, &RemoteError::network("timed out"));

        assert!(notice.is_error());
        assert_eq!(
            notice.message,
            "Failed to delete todo: timed out (NETWORK_ERROR). Please try again."
        );
    }

    #[test]
    fn test_partial_create_mentions_text() {
        let notice = Notice::partial_create("task", &RemoteError::storage("bucket missing"));
        assert!(notice.message.starts_with("Added \"task\""));
        assert!(notice.message.contains("STORAGE_ERROR"));
    }

    #[test]
    fn test_display_prefix() {
        assert_eq!(Notice::success("done").to_string(), "ok: done");
        assert_eq!(Notice::info("hi").to_string(), "info: hi");
    }

    #[test]
    fn test_empty_list_hint() {
        assert!(empty_list_hint(true).contains("Nothing planned"));
        assert!(empty_list_hint(false).contains("Sign in"));
    }
}
