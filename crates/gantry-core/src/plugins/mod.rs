//! Built-in plugins, registered from the composition root.

pub mod hmac;
pub mod memory;
pub mod trace_log;

use crate::plugin::{PluginInfo, PluginRegistry};

/// Registers every built-in plugin. [`PluginRegistry::builtin`] calls this;
/// embedders composing their own registry can too.
pub fn register_builtin(registry: &mut PluginRegistry) {
    registry.register(PluginInfo {
        name: "hmac",
        description: "Authenticates requests by HMAC-SHA1 signatures over the Date header.",
        link: "https://github.com/gantry-proxy/gantry/tree/master/docs/plugins/hmac.md",
        factory: || Box::new(hmac::HmacKeyAuth::default()),
    });
    registry.register(PluginInfo {
        name: "memory",
        description: "In-memory user/key management backend for development and testing.",
        link: "https://github.com/gantry-proxy/gantry/tree/master/docs/plugins/memory.md",
        factory: || Box::new(memory::MemoryBackend::default()),
    });
    registry.register(PluginInfo {
        name: "log-tracing",
        description: "Emits request log records as structured tracing events.",
        link: "https://github.com/gantry-proxy/gantry/tree/master/docs/plugins/log-tracing.md",
        factory: || Box::new(trace_log::TraceLogger::default()),
    });
}
