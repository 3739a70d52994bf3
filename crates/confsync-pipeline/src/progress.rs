use confsync_core::{Category, CategorySet};

use crate::categories;

/// Weighted progress across the steps of one pipeline run.
///
/// Every step owns a fixed share of the budget proportional to its weight.
/// Inside the running step, progress is interpolated over the number of
/// records once that is known. The reported percentage never decreases and
/// only reaches 100 when every step has finished.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    completed: u64,
    step_weight: u64,
    step_items: u64,
    step_done: u64,
    last: u8,
}

impl ProgressTracker {
    /// Budget for `categories` plus `extra` weight for non-category steps
    /// (archive assembly, extraction).
    pub fn new(categories: &CategorySet, extra: u32) -> Self {
        let total: u64 = categories
            .iter()
            .map(|c| categories::spec(c).weight as u64)
            .sum::<u64>()
            + extra as u64;
        Self {
            total: total.max(1),
            completed: 0,
            step_weight: 0,
            step_items: 0,
            step_done: 0,
            last: 0,
        }
    }

    pub fn begin_category(&mut self, category: Category) {
        self.begin_step(categories::spec(category).weight);
    }

    pub fn begin_step(&mut self, weight: u32) {
        self.step_weight = weight as u64;
        self.step_items = 0;
        self.step_done = 0;
    }

    /// Number of records the current step will process.
    pub fn set_items(&mut self, items: usize) {
        self.step_items = items as u64;
        self.step_done = 0;
    }

    pub fn item_done(&mut self) -> u8 {
        if self.step_done < self.step_items {
            self.step_done += 1;
        }
        self.percent()
    }

    pub fn finish_step(&mut self) -> u8 {
        self.completed = (self.completed + self.step_weight).min(self.total);
        self.step_weight = 0;
        self.step_items = 0;
        self.step_done = 0;
        self.percent()
    }

    pub fn percent(&mut self) -> u8 {
        // Scale by 1000 so per-item steps inside small weights still move.
        let mut units = self.completed * 1000;
        if self.step_items > 0 {
            units += self.step_weight * 1000 * self.step_done / self.step_items;
        }
        let pct = (units * 100 / (self.total * 1000)).min(100) as u8;
        self.last = self.last.max(pct);
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaches_exactly_100_after_all_steps() {
        let cats: CategorySet = Category::ALL.into_iter().collect();
        let mut p = ProgressTracker::new(&cats, 1);
        for c in cats.iter() {
            p.begin_category(c);
            p.set_items(3);
            for _ in 0..3 {
                assert!(p.item_done() < 100);
            }
            p.finish_step();
        }
        assert!(p.percent() < 100);
        p.begin_step(1);
        assert_eq!(p.finish_step(), 100);
    }

    #[test]
    fn heavier_categories_move_progress_further() {
        let cats: CategorySet = [Category::Users, Category::Channels].into_iter().collect();
        let mut p = ProgressTracker::new(&cats, 0);
        p.begin_category(Category::Users);
        let after_users = p.finish_step();
        p.begin_category(Category::Channels);
        let after_channels = p.finish_step();
        assert!(after_users < after_channels - after_users);
        assert_eq!(after_channels, 100);
    }

    #[test]
    fn never_decreases() {
        let cats: CategorySet = [Category::Logos].into_iter().collect();
        let mut p = ProgressTracker::new(&cats, 0);
        p.begin_category(Category::Logos);
        p.set_items(4);
        p.item_done();
        let mid = p.item_done();
        p.set_items(10);
        assert!(p.percent() >= mid);
    }

    #[test]
    fn empty_selection_does_not_divide_by_zero() {
        let mut p = ProgressTracker::new(&CategorySet::empty(), 0);
        assert_eq!(p.percent(), 0);
    }
}
