pub mod config;
pub mod conversation;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod generator;
pub mod sanitizer;
pub mod stream;
pub mod tool_loop;
pub mod tools;
