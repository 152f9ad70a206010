//! Human-readable report of the rights held in a manager.

use crate::manager::{HierarchicalAccessManager, ManagerStats};
use arbiter_core::{Right, RightsSnapshot};
use std::fmt;

/// Snapshot of a manager's rights with tree statistics.
#[derive(Debug, Clone)]
pub struct AccessReport {
    pub rights: RightsSnapshot,
    pub stats: ManagerStats,
}

impl AccessReport {
    pub fn build<I>(manager: &HierarchicalAccessManager<I>) -> Self
    where
        I: Clone + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            rights: manager.rights(),
            stats: manager.stats(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push('\n');
        out.push_str("╔══════════════════════════════════════════════════════════════╗\n");
        out.push_str("║                    ARBITER RIGHTS REPORT                     ║\n");
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        out.push_str(&format!(
            "║  Read rights:        {:>39} ║\n",
            self.rights.read.len()
        ));
        out.push_str(&format!(
            "║  Write rights:       {:>39} ║\n",
            self.rights.write.len()
        ));
        out.push_str(&format!(
            "║  Tree nodes (r/w):   {:>39} ║\n",
            format!("{}/{}", self.stats.read_nodes, self.stats.write_nodes)
        ));
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        if self.rights.is_empty() {
            out.push_str("║  No rights held.                                             ║\n");
        } else {
            render_section(&mut out, "WRITE", &self.rights.write);
            render_section(&mut out, "READ", &self.rights.read);
        }

        out.push_str("╚══════════════════════════════════════════════════════════════╝\n");
        out
    }
}

fn render_section(out: &mut String, title: &str, rights: &[Right]) {
    if rights.is_empty() {
        return;
    }
    out.push_str(&format!("║  {title}\n"));
    for right in rights {
        out.push_str(&format!("║     {right}\n"));
    }
}
