pub mod image;
pub mod item;
pub mod list;

pub use image::ImageUpload;
pub use item::{ImageRef, ItemId, NewTodo, TodoItem, TodoPatch};
pub use list::TodoList;
