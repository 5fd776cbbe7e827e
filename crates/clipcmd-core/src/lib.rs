pub mod command;
pub mod command_line;
pub mod commands_ini;
pub mod engine;
pub mod error;
pub mod item;
pub mod keybind;
pub mod matcher;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod runner;
pub mod settings;
pub mod supervisor;
