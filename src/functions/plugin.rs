use crate::functions::TransformFunction;
use std::sync::Arc;

/// Turns a session's plugin payload into additional registrations.
pub trait PluginLoader: Send + Sync {
    fn load(&self, payload: &[u8]) -> Result<Vec<(String, Arc<dyn TransformFunction>)>, String>;
}

/// Loader for deployments that only use built-in functions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlugins;

impl PluginLoader for NoPlugins {
    fn load(&self, payload: &[u8]) -> Result<Vec<(String, Arc<dyn TransformFunction>)>, String> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Err(format!(
            "Plugin payload of {} bytes received but no plugin loader is configured",
            payload.len()
        ))
    }
}
