mod selector;

pub use selector::{DisqualifyReason, HostSelector, ScoredHost, Selection, SelectionReason};
