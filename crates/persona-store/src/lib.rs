pub mod memory;
pub mod sled_store;

pub use memory::MemoryRepository;
pub use sled_store::SledRepository;

pub use persona_core::Repository;
pub use persona_error::{PersonaError, Result};

/// Keeps the most recent `limit` items of an insertion-ordered list.
fn keep_last<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::keep_last;

    #[test]
    fn test_keep_last() {
        assert_eq!(keep_last(vec![1, 2, 3, 4], Some(2)), vec![3, 4]);
        assert_eq!(keep_last(vec![1, 2], Some(5)), vec![1, 2]);
        assert_eq!(keep_last(vec![1, 2], None), vec![1, 2]);
    }
}
