use super::item::{ImageRef, ItemId, TodoItem};
use std::collections::{HashMap, HashSet};

/// Local newest-first snapshot of the principal's items.
///
/// The setters return the previous value so callers can revert an
/// optimistic change without cloning the whole list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoList {
    items: Vec<TodoItem>,
}

impl TodoList {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn with_items(items: Vec<TodoItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, id: ItemId) -> Option<&TodoItem> {
        self.items.iter().find(|item| item.id == id)
    }

    fn get_mut(&mut self, id: ItemId) -> Option<&mut TodoItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    pub fn position(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    pub fn replace_all(&mut self, items: Vec<TodoItem>) {
        self.items = items;
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Newly created items go on top. An item already present is replaced in place.
    pub fn prepend(&mut self, item: TodoItem) {
        if let Some(existing) = self.get_mut(item.id) {
            *existing = item;
            return;
        }
        self.items.insert(0, item);
    }

    pub fn set_completed(&mut self, id: ItemId, completed: bool) -> Option<bool> {
        let item = self.get_mut(id)?;
        Some(std::mem::replace(&mut item.completed, completed))
    }

    pub fn set_text(&mut self, id: ItemId, text: String) -> Option<String> {
        let item = self.get_mut(id)?;
        Some(std::mem::replace(&mut item.text, text))
    }

    pub fn set_image(&mut self, id: ItemId, image: Option<ImageRef>) -> Option<Option<ImageRef>> {
        let item = self.get_mut(id)?;
        Some(std::mem::replace(&mut item.image, image))
    }

    pub fn remove(&mut self, id: ItemId) -> Option<TodoItem> {
        let index = self.position(id)?;
        Some(self.items.remove(index))
    }

    pub fn snapshot(&self) -> Vec<TodoItem> {
        self.items.clone()
    }

    /// Restore the membership and ordering captured in `snapshot` after a
    /// failed delete of `restored_id`.
    ///
    /// Items still present keep their current value, items created after the
    /// snapshot stay on top, and items removed since the snapshot stay removed
    /// unless they are `restored_id`.
    pub fn restore_from(&mut self, snapshot: Vec<TodoItem>, restored_id: ItemId) {
        let snapshot_ids: HashSet<ItemId> = snapshot.iter().map(|item| item.id).collect();

        let mut created_since = Vec::new();
        let mut current: HashMap<ItemId, TodoItem> = HashMap::new();
        for item in self.items.drain(..) {
            if snapshot_ids.contains(&item.id) {
                current.insert(item.id, item);
            } else {
                created_since.push(item);
            }
        }

        let mut restored = created_since;
        for item in snapshot {
            if let Some(live) = current.remove(&item.id) {
                restored.push(live);
            } else if item.id == restored_id {
                restored.push(item);
            }
        }

        self.items = restored;
    }

    pub fn completed_count(&self) -> usize {
        self.items.iter().filter(|item| item.completed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    fn item(id: i64, text: &str) -> TodoItem {
        let created = Utc::now() - Duration::minutes(id);
        TodoItem {
            id: ItemId(id),
            user_id: "user-1".to_string(),
            text: text.to_string(),
            completed: false,
            image: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn create_test_list() -> TodoList {
        TodoList::with_items(vec![item(3, "Task 3"), item(2, "Task 2"), item(1, "Task 1")])
    }

    fn ids(list: &TodoList) -> Vec<i64> {
        list.items().iter().map(|item| item.id.0).collect()
    }

    #[test]
    fn test_new() {
        let list = TodoList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_prepend_puts_item_on_top() {
        let mut list = create_test_list();
        list.prepend(item(4, "Task 4"));

        assert_eq!(ids(&list), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_prepend_existing_replaces_in_place() {
        let mut list = create_test_list();
        let mut updated = item(2, "Task 2 (server)");
        updated.completed = true;

        list.prepend(updated);

        assert_eq!(ids(&list), vec![3, 2, 1]);
        assert_eq!(list.get(ItemId(2)).unwrap().text, "Task 2 (server)");
    }

    #[test]
    fn test_set_completed_returns_previous() {
        let mut list = create_test_list();

        assert_eq!(list.set_completed(ItemId(2), true), Some(false));
        assert!(list.get(ItemId(2)).unwrap().completed);
        assert_eq!(list.set_completed(ItemId(99), true), None);
        assert_eq!(list.completed_count(), 1);
    }

    #[test]
    fn test_set_text_returns_previous() {
        let mut list = create_test_list();

        let previous = list.set_text(ItemId(1), "Renamed".to_string());

        assert_eq!(previous.as_deref(), Some("Task 1"));
        assert_eq!(list.get(ItemId(1)).unwrap().text, "Renamed");
    }

    #[test]
    fn test_set_image_returns_previous() {
        let mut list = create_test_list();
        let image = ImageRef::new("memory://a.png", "a.png");

        assert_eq!(list.set_image(ItemId(3), Some(image.clone())), Some(None));
        assert_eq!(list.set_image(ItemId(3), None), Some(Some(image)));
    }

    #[test]
    fn test_remove() {
        let mut list = create_test_list();

        let removed = list.remove(ItemId(2)).unwrap();

        assert_eq!(removed.text, "Task 2");
        assert_eq!(ids(&list), vec![3, 1]);
        assert!(list.remove(ItemId(2)).is_none());
    }

    #[test]
    fn test_restore_from_snapshot_restores_order() {
        let mut list = create_test_list();
        let snapshot = list.snapshot();

        list.remove(ItemId(2));
        list.restore_from(snapshot.clone(), ItemId(2));

        assert_eq!(list.items(), snapshot.as_slice());
    }

    #[test]
    fn test_restore_keeps_concurrent_changes() {
        let mut list = create_test_list();
        let snapshot = list.snapshot();

        list.remove(ItemId(2));
        // Meanwhile: another item toggled, one created, one deleted for good
        list.set_completed(ItemId(3), true);
        list.prepend(item(10, "Fresh"));
        list.remove(ItemId(1));

        list.restore_from(snapshot, ItemId(2));

        assert_eq!(ids(&list), vec![10, 3, 2]);
        assert!(list.get(ItemId(3)).unwrap().completed);
    }
}
