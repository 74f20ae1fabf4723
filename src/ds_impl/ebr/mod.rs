pub mod concurrent_set;

pub mod bst;

pub use self::concurrent_set::ConcurrentSet;

pub use self::bst::BST;
