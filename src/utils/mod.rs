// Utility modules shared by the plugin and the agent
pub mod constants;
pub mod filesystem;
pub mod validation;
