//! Workspace id to directory lookup.

use collections::FxHashMap;
use settings::Config;
use std::path::PathBuf;

/// Suggests a starting directory for sessions that belong to a workspace.
///
/// The manager checks that the suggestion exists before using it.
pub trait WorkspaceResolver: Send + Sync {
    fn resolve_working_directory(&self, workspace_id: Option<&str>) -> Option<PathBuf>;
}

/// Knows no workspaces.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWorkspaces;

impl WorkspaceResolver for NoWorkspaces {
    fn resolve_working_directory(&self, _workspace_id: Option<&str>) -> Option<PathBuf> {
        None
    }
}

/// Fixed table, usually built from the `[[workspaces]]` config section.
#[derive(Clone, Debug, Default)]
pub struct StaticWorkspaceResolver {
    paths: FxHashMap<String, PathBuf>,
}

impl StaticWorkspaceResolver {
    pub fn new(entries: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        Self {
            paths: entries.into_iter().collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .workspaces
                .iter()
                .filter(|entry| !entry.id.is_empty())
                .filter_map(|entry| Some((entry.id.clone(), config.workspace_path(&entry.id)?))),
        )
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl WorkspaceResolver for StaticWorkspaceResolver {
    fn resolve_working_directory(&self, workspace_id: Option<&str>) -> Option<PathBuf> {
        self.paths.get(workspace_id?).cloned()
    }
}
