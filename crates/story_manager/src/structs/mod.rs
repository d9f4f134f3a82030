pub mod branch;
pub mod event;
pub mod history;
pub mod history_branches;
pub mod page;
pub mod story_state;
pub mod turn;
pub mod world;
