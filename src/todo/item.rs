use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier assigned by the item store on insert. Never chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .trim_start_matches('#')
            .parse::<i64>()
            .map(ItemId)
            .map_err(|_| format!("Invalid todo id: {s}"))
    }
}

/// Reference to the single stored image of an item.
///
/// `path` is the object key inside the storage bucket. Rows written before
/// paths were stored only carry the public URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl ImageRef {
    pub fn new(url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: Some(path.into()),
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoItem {
    pub id: ItemId,
    /// Principal owning the row
    pub user_id: String,
    pub text: String,
    pub completed: bool,
    pub image: Option<ImageRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TodoItem {
    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

/// Fields sent to the item store on insert
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewTodo {
    pub user_id: String,
    pub text: String,
    pub completed: bool,
}

impl NewTodo {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            completed: false,
        }
    }
}

/// Partial update of a single row. `None` leaves the field untouched;
/// `image: Some(None)` clears the image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoPatch {
    pub text: Option<String>,
    pub completed: Option<bool>,
    pub image: Option<Option<ImageRef>>,
}

impl TodoPatch {
    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn image(image: Option<ImageRef>) -> Self {
        Self {
            image: Some(image),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.completed.is_none() && self.image.is_none()
    }

    /// Apply to an in-process row, bumping `updated_at`
    pub fn apply_to(&self, item: &mut TodoItem, now: DateTime<Utc>) {
        if let Some(text) = &self.text {
            item.text = text.clone();
        }
        if let Some(completed) = self.completed {
            item.completed = completed;
        }
        if let Some(image) = &self.image {
            item.image = image.clone();
        }
        item.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> TodoItem {
        let now = Utc::now();
        TodoItem {
            id: ItemId(7),
            user_id: "user-1".to_string(),
            text: "buy milk".to_string(),
            completed: false,
            image: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_item_id_parse() {
        assert_eq!("42".parse::<ItemId>().unwrap(), ItemId(42));
        assert_eq!("#42".parse::<ItemId>().unwrap(), ItemId(42));
        assert_eq!(" 3 ".parse::<ItemId>().unwrap(), ItemId(3));
        assert!("abc".parse::<ItemId>().is_err());
    }

    #[test]
    fn test_item_id_serializes_as_number() {
        let json = serde_json::to_string(&ItemId(5)).unwrap();
        assert_eq!(json, "5");
    }

    #[test]
    fn test_new_todo_starts_incomplete() {
        let new = NewTodo::new("u", "task");
        assert!(!new.completed);
        assert_eq!(new.text, "task");
    }

    #[test]
    fn test_patch_apply_only_touches_given_fields() {
        let mut item = sample_item();
        let later = item.updated_at + chrono::Duration::seconds(5);

        TodoPatch::completed(true).apply_to(&mut item, later);

        assert!(item.completed);
        assert_eq!(item.text, "buy milk");
        assert_eq!(item.updated_at, later);
    }

    #[test]
    fn test_patch_can_clear_image() {
        let mut item = sample_item();
        item.image = Some(ImageRef::new("https://x/y.png", "u/7.png"));

        TodoPatch::image(None).apply_to(&mut item, Utc::now());

        assert!(!item.has_image());
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(TodoPatch::default().is_empty());
        assert!(!TodoPatch::text("a").is_empty());
        assert!(!TodoPatch::image(None).is_empty());
    }
}
