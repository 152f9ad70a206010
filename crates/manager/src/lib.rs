//! Hierarchical access manager, right trie, availability tracking, report, and event sink.

pub mod availability;
pub mod manager;
pub mod reporter;
pub mod result;
pub mod sink;
pub mod tree;

pub use availability::{multi_action, AvailabilityNotifier, GroupAction};
pub use manager::{AccessChangeListener, AccessStateListener, HierarchicalAccessManager, ManagerStats};
pub use reporter::AccessReport;
pub use result::AccessResult;
pub use tree::{RightTree, TreeRef};
