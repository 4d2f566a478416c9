use serde::Serialize;

use crate::config::LaneBudgets;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Summary,
    Intake,
    HotWindow,
    Viewport,
    Unit,
    Path,
    Concept,
    User,
    Retrieval,
    Materials,
    Graph,
}

impl Lane {
    pub const ALL: [Lane; 11] = [
        Lane::Summary,
        Lane::Intake,
        Lane::HotWindow,
        Lane::Viewport,
        Lane::Unit,
        Lane::Path,
        Lane::Concept,
        Lane::User,
        Lane::Retrieval,
        Lane::Materials,
        Lane::Graph,
    ];

    fn base(self, budgets: &LaneBudgets) -> usize {
        match self {
            Lane::Summary => budgets.summary,
            Lane::Intake => budgets.intake,
            Lane::HotWindow => budgets.hot_window,
            Lane::Viewport => budgets.viewport,
            Lane::Unit => budgets.unit,
            Lane::Path => budgets.path,
            Lane::Concept => budgets.concept,
            Lane::User => budgets.user,
            Lane::Retrieval => budgets.retrieval,
            Lane::Materials => budgets.materials,
            Lane::Graph => budgets.graph,
        }
    }
}

/// Per-lane token allowance after redistribution
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Allocation {
    lanes: Vec<(Lane, usize)>,
    pub total: usize,
}

impl Allocation {
    pub fn get(&self, lane: Lane) -> usize {
        self.lanes
            .iter()
            .find(|(l, _)| *l == lane)
            .map(|(_, t)| *t)
            .unwrap_or(0)
    }

    pub fn sum(&self) -> usize {
        self.lanes.iter().map(|(_, t)| t).sum()
    }
}

/// Split the budget over `enabled` lanes
///
/// Tokens of disabled lanes go to the first enabled of retrieval, hot window,
/// summary. If the result still exceeds the total ceiling every lane is scaled
/// down proportionally.
pub fn allocate(budgets: &LaneBudgets, enabled: &[Lane]) -> Allocation {
    let mut lanes: Vec<(Lane, usize)> = Vec::new();
    let mut freed = 0usize;
    for lane in Lane::ALL {
        if enabled.contains(&lane) {
            lanes.push((lane, lane.base(budgets)));
        } else {
            freed += lane.base(budgets);
        }
    }

    let sink = [Lane::Retrieval, Lane::HotWindow, Lane::Summary]
        .into_iter()
        .find(|l| enabled.contains(l));
    if let Some(sink) = sink {
        if let Some(slot) = lanes.iter_mut().find(|(l, _)| *l == sink) {
            slot.1 += freed;
        }
    }

    let sum: usize = lanes.iter().map(|(_, t)| t).sum();
    if sum > budgets.total && sum > 0 {
        let ratio = budgets.total as f64 / sum as f64;
        for slot in lanes.iter_mut() {
            slot.1 = (slot.1 as f64 * ratio).floor() as usize;
        }
    }

    Allocation {
        lanes,
        total: budgets.total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unused_lanes_flow_into_retrieval() {
        let budgets = LaneBudgets::default();
        let alloc = allocate(&budgets, &[Lane::HotWindow, Lane::Retrieval]);
        assert_eq!(alloc.get(Lane::HotWindow), budgets.hot_window);
        assert!(alloc.get(Lane::Retrieval) > budgets.retrieval);
        assert_eq!(alloc.get(Lane::Unit), 0);
        assert!(alloc.sum() <= budgets.total);
    }

    #[test]
    fn test_falls_back_to_hot_window_without_retrieval() {
        let budgets = LaneBudgets::default();
        let alloc = allocate(&budgets, &[Lane::HotWindow, Lane::Summary]);
        assert!(alloc.get(Lane::HotWindow) > budgets.hot_window);
        assert_eq!(alloc.get(Lane::Summary), budgets.summary);
    }

    #[test]
    fn test_total_ceiling_enforced() {
        let budgets = LaneBudgets {
            total: 1_000,
            ..LaneBudgets::default()
        };
        let alloc = allocate(&budgets, &Lane::ALL);
        assert!(alloc.sum() <= 1_000);
        assert!(alloc.get(Lane::HotWindow) > alloc.get(Lane::User));
    }
}
