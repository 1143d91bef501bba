use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::grid::CellId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Setup,
    Active,
    Paused,
    Finished,
}

/// Server-confirmed visit to one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitRecord {
    pub cell_id: CellId,
    pub visit_count: u32,
    pub dwell_s: u32,
}

/// Local mirror of one game. Visit counts and score are only ever written
/// from backend responses.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub nickname: String,
    pub min_dwell_s: u32,
    pub time_limit_s: Option<u32>,
    pub total_cells: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: SessionPhase,
    pub visited_count: u32,
    pub score_pct: f64,
    visits: HashMap<CellId, VisitRecord>,
}

impl Session {
    pub fn new(
        id: String,
        nickname: String,
        min_dwell_s: u32,
        time_limit_s: Option<u32>,
        total_cells: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            nickname,
            min_dwell_s,
            time_limit_s,
            total_cells,
            started_at,
            finished_at: None,
            phase: SessionPhase::Setup,
            visited_count: 0,
            score_pct: 0.0,
            visits: HashMap::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase == SessionPhase::Finished
    }

    pub fn visit(&self, cell_id: &CellId) -> Option<&VisitRecord> {
        self.visits.get(cell_id)
    }

    pub fn has_visited(&self, cell_id: &CellId) -> bool {
        self.visits.contains_key(cell_id)
    }

    /// Visits sorted by cell id, for stable output.
    pub fn visits(&self) -> Vec<VisitRecord> {
        let mut visits: Vec<_> = self.visits.values().cloned().collect();
        visits.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));
        visits
    }

    pub fn visit_records(&self) -> usize {
        self.visits.len()
    }

    /// Store the record exactly as the backend reported it.
    pub fn put_visit(&mut self, record: VisitRecord) {
        self.visits.insert(record.cell_id.clone(), record);
    }

    pub fn set_score(&mut self, visited_count: u32, score_pct: f64) {
        self.visited_count = visited_count;
        self.score_pct = score_pct;
    }

    /// When the time limit runs out, if the game has one.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.time_limit_s
            .map(|s| self.started_at + chrono::Duration::seconds(i64::from(s)))
    }
}

/// Visited share of the grid as a percentage rounded to one decimal, the way
/// the backend reports `score_pct`.
pub fn score_pct(visited_count: u32, total_cells: u32) -> f64 {
    if total_cells == 0 {
        return 0.0;
    }
    (f64::from(visited_count) / f64::from(total_cells) * 1000.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_pct_rounds_to_one_decimal() {
        assert_eq!(score_pct(1, 4), 25.0);
        assert_eq!(score_pct(1, 3), 33.3);
        assert_eq!(score_pct(2, 3), 66.7);
        assert_eq!(score_pct(0, 0), 0.0);
    }

    #[test]
    fn test_put_visit_replaces_record() {
        let mut s = Session::new("g".into(), "p".into(), 10, None, 4, Utc::now());
        let a = CellId::from("A");
        s.put_visit(VisitRecord { cell_id: a.clone(), visit_count: 1, dwell_s: 12 });
        s.put_visit(VisitRecord { cell_id: a.clone(), visit_count: 2, dwell_s: 10 });
        assert_eq!(s.visit_records(), 1);
        assert_eq!(s.visit(&a).map(|v| v.visit_count), Some(2));
    }

    #[test]
    fn test_deadline_from_time_limit() {
        let start = Utc::now();
        let s = Session::new("g".into(), "p".into(), 10, Some(600), 4, start);
        assert_eq!(s.deadline(), Some(start + chrono::Duration::seconds(600)));
    }
}
