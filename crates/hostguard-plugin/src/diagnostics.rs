//! Aggregate registry health.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hostguard_core::PluginState;
use serde::Serialize;

use crate::registry::PluginStatus;

/// One row of [`RegistryDiagnostics`].
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub state: PluginState,
    pub version: String,
    pub path: PathBuf,
    pub enabled: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub load_duration: Option<Duration>,
    pub fault_count: usize,
    /// Details of the most recent fault.
    pub last_fault: Option<String>,
}

impl From<&PluginStatus> for PluginSummary {
    fn from(status: &PluginStatus) -> Self {
        Self {
            name: status.name.clone(),
            state: status.state,
            version: status
                .info
                .as_ref()
                .map(|info| info.version.clone())
                .unwrap_or_default(),
            path: status.path.clone(),
            enabled: status.config.enabled,
            loaded_at: status.loaded_at,
            load_duration: status.load_duration,
            fault_count: status.faults.len(),
            last_fault: status.faults.last().map(|fault| fault.details.clone()),
        }
    }
}

/// Snapshot of the registry for status displays.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryDiagnostics {
    pub total: usize,
    pub active: usize,
    pub errored: usize,
    pub disabled: usize,
    pub max_plugins: usize,
    /// Sum of load durations over all active plugins.
    pub total_load_time: Duration,
    pub plugins: Vec<PluginSummary>,
}

impl RegistryDiagnostics {
    pub(crate) fn new(statuses: &[PluginStatus], max_plugins: usize) -> Self {
        let plugins: Vec<PluginSummary> = statuses.iter().map(PluginSummary::from).collect();
        Self {
            total: plugins.len(),
            active: plugins.iter().filter(|p| p.state.is_active()).count(),
            errored: plugins
                .iter()
                .filter(|p| p.state == PluginState::Error)
                .count(),
            disabled: plugins.iter().filter(|p| !p.enabled).count(),
            max_plugins,
            total_load_time: plugins
                .iter()
                .filter(|p| p.state.is_active())
                .filter_map(|p| p.load_duration)
                .sum(),
            plugins,
        }
    }

    /// Mean load time of active plugins.
    pub fn average_load_time(&self) -> Option<Duration> {
        u32::try_from(self.active)
            .ok()
            .filter(|&active| active > 0)
            .map(|active| self.total_load_time / active)
    }

    pub fn has_errors(&self) -> bool {
        self.errored > 0
    }
}

impl fmt::Display for RegistryDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} plugins ({} active, {} errored, {} disabled), capacity {}",
            self.total, self.active, self.errored, self.disabled, self.max_plugins
        )?;
        writeln!(f, "Total load time: {:.2?}", self.total_load_time)?;
        for plugin in &self.plugins {
            write!(f, "  {:<24} {:<12} {:<10}", plugin.name, plugin.state, plugin.version)?;
            if let Some(duration) = plugin.load_duration {
                write!(f, " {duration:.2?}")?;
            }
            if let Some(fault) = &plugin.last_fault {
                write!(f, "  ({fault})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_diagnostics() {
        let diagnostics = RegistryDiagnostics::new(&[], 32);
        assert_eq!(diagnostics.total, 0);
        assert_eq!(diagnostics.average_load_time(), None);
        assert!(!diagnostics.has_errors());
        assert!(diagnostics.to_string().contains("capacity 32"));
    }
}
