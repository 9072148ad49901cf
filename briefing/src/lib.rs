// Library interface for briefing modules
// This allows tests and the binary to import modules

pub mod agents;
pub mod bot;
pub mod delivery;
pub mod history;
pub mod llm;
pub mod pipeline;
pub mod render;
pub mod scheduler;
pub mod sessions;
pub mod sources;
