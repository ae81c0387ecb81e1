pub mod activity;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod reaper;
pub mod registry;
pub mod tracker;
