use std::fmt;

use crate::backend::RemoteError;
use crate::todo::{ItemId, TodoItem};

/// Why an operation was refused before any remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    EmptyText,
    NoEditInProgress,
    NotFound(ItemId),
    NotSignedIn,
    /// Another mutation of the same item is still in flight
    Busy(ItemId),
    ImageAlreadyAttached(ItemId),
    NoImageAttached(ItemId),
    UnrecognizedImageReference(ItemId),
    EmptyImage,
    ImageTooLarge { size: u64, limit: u64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::EmptyText => write!(f, "Text cannot be empty"),
            Rejection::NoEditInProgress => write!(f, "No edit in progress"),
            Rejection::NotFound(id) => write!(f, "Todo {id} not found"),
            Rejection::NotSignedIn => write!(f, "Sign in first"),
            Rejection::Busy(id) => write!(f, "Todo {id} is still being saved"),
            Rejection::ImageAlreadyAttached(id) => write!(f, "Todo {id} already has an image"),
            Rejection::NoImageAttached(id) => write!(f, "Todo {id} has no image"),
            Rejection::UnrecognizedImageReference(id) => {
                write!(f, "Image reference of todo {id} is not recognized")
            }
            Rejection::EmptyImage => write!(f, "Image file is empty"),
            Rejection::ImageTooLarge { size, limit } => {
                write!(f, "Image is {size} bytes, the limit is {limit} bytes")
            }
        }
    }
}

/// Outcome of a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation<T = ()> {
    /// Confirmed remotely; local state reflects it
    Applied(T),
    /// Refused locally; nothing was sent and nothing changed
    Rejected(Rejection),
    /// The remote call failed and the local change was reverted
    RolledBack(RemoteError),
}

impl<T> Mutation<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Mutation::Applied(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Mutation::Rejected(_))
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Mutation::RolledBack(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Mutation::Applied(value) => Some(value),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Mutation::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&RemoteError> {
        match self {
            Mutation::RolledBack(error) => Some(error),
            _ => None,
        }
    }
}

/// Result of a successful insert, possibly without the requested image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub item: TodoItem,
    pub image_error: Option<RemoteError>,
}

impl Created {
    pub fn is_partial(&self) -> bool {
        self.image_error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSession {
    pub id: ItemId,
    pub text: String,
}

/// Image dimension of an item: `NoImage -> Uploading -> HasImage -> NoImage`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    NoImage,
    Uploading,
    HasImage,
}
