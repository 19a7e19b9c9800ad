use std::path::PathBuf;
use std::sync::Arc;

use shrimp_shell::ShellPool;

/// Capability object threaded through every tool handler — "global
/// singletons ... must become explicit capability objects".
pub struct ToolContext {
    pub shell: Arc<ShellPool>,
    /// Default cwd for the ephemeral (no-session-id) `run_command` path.
    pub workspace_root: PathBuf,
    /// Backing file for `update_system_prompt_memory` et al.
    pub memory_path: PathBuf,
}

impl ToolContext {
    pub fn new(shell: Arc<ShellPool>, workspace_root: PathBuf, memory_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            shell,
            workspace_root,
            memory_path,
        })
    }
}
