//! Bleeding cycle reconstruction from daily PBAC scores.
//!
//! Entries are walked in date order and each day is classified by score:
//! - missing: no score, skipped without touching any counter
//! - zero: extends the zero streak and closes any open cycle
//! - spotting (`0 < score <= spotting_max`): joins an open cycle
//! - bleeding (`score >= bleeding_min`): opens, reopens or extends a cycle
//!
//! A calendar gap between two entries counts as that many zero days. A bleed
//! preceded by fewer than `min_zeros_before_new_bleed` zero days reopens the
//! previous cycle instead of starting a new one.

use crate::{Cycle, CycleDay, DailyEntry, PbacRules};
use chrono::NaiveDate;
use std::collections::BTreeSet;

/// Cycles plus the per-day flags shown by presentation layers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeriodFlags {
    pub cycles: Vec<Cycle>,
    /// Every bleeding day inside a cycle
    pub period_set: BTreeSet<NaiveDate>,
    /// First bleeding day of each cycle
    pub start_set: BTreeSet<NaiveDate>,
    /// Every spotting-range day, inside a cycle or not
    pub spotting_set: BTreeSet<NaiveDate>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DayClass {
    Missing,
    Zero,
    Spotting(u32),
    Bleeding(u32),
    /// Positive but between the spotting and bleeding thresholds
    Unclassified,
}

fn classify(score: Option<u32>, rules: &PbacRules) -> DayClass {
    match score {
        None => DayClass::Missing,
        Some(0) => DayClass::Zero,
        Some(s) if s >= rules.bleeding_min => DayClass::Bleeding(s),
        Some(s) if s <= rules.spotting_max => DayClass::Spotting(s),
        Some(_) => DayClass::Unclassified,
    }
}

/// At most one cycle is open, and it is always addressed by index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CycleState {
    Idle,
    Open(usize),
}

struct Reconstructor<'r> {
    rules: &'r PbacRules,
    cycles: Vec<Cycle>,
    state: CycleState,
    zero_streak: u32,
    positive_run: bool,
    zeros_before_run: u32,
    /// Spotting days of the current positive run seen while no cycle was open
    lead_in: Vec<CycleDay>,
    prev: Option<NaiveDate>,
}

impl<'r> Reconstructor<'r> {
    fn new(rules: &'r PbacRules) -> Self {
        let seed = rules.min_zeros_before_new_bleed;
        Self {
            rules,
            cycles: Vec::new(),
            state: CycleState::Idle,
            zero_streak: seed,
            positive_run: false,
            zeros_before_run: seed,
            lead_in: Vec::new(),
            prev: None,
        }
    }

    fn close(&mut self) {
        self.state = CycleState::Idle;
    }

    fn end_positive_run(&mut self) {
        self.positive_run = false;
        self.zeros_before_run = self.zero_streak;
        self.lead_in.clear();
        self.close();
    }

    /// Open a cycle for a bleeding day, either fresh or by reopening the last
    fn open_for(&mut self, date: NaiveDate) -> usize {
        let start_new =
            self.zeros_before_run >= self.rules.min_zeros_before_new_bleed || self.cycles.is_empty();

        let index = if start_new {
            let start = self.lead_in.first().map_or(date, |d| d.date);
            self.cycles.push(Cycle {
                start,
                end: date,
                days: Vec::new(),
                pbac_sum: 0,
            });
            self.cycles.len() - 1
        } else {
            tracing::trace!("Reopening cycle for bleed on {}", date);
            self.cycles.len() - 1
        };

        let lead_in = std::mem::take(&mut self.lead_in);
        self.cycles[index].days.extend(lead_in);
        self.state = CycleState::Open(index);
        index
    }

    fn advance(&mut self, date: NaiveDate, score: Option<u32>) {
        if let Some(prev) = self.prev {
            let gap = (date - prev).num_days();
            if gap > 1 {
                let missing = u32::try_from(gap - 1).unwrap_or(u32::MAX);
                self.zero_streak = self.zero_streak.saturating_add(missing);
                self.end_positive_run();
            }
        }

        match classify(score, self.rules) {
            DayClass::Missing => {}
            DayClass::Zero => {
                self.zero_streak = self.zero_streak.saturating_add(1);
                self.end_positive_run();
            }
            positive => {
                if !self.positive_run {
                    self.positive_run = true;
                    self.zeros_before_run = self.zero_streak;
                }
                self.zero_streak = 0;

                match positive {
                    DayClass::Bleeding(pbac) => {
                        let index = match self.state {
                            CycleState::Open(index) => index,
                            CycleState::Idle => self.open_for(date),
                        };
                        let cycle = &mut self.cycles[index];
                        cycle.days.push(CycleDay {
                            date,
                            pbac,
                            spotting: false,
                        });
                        cycle.pbac_sum += pbac;
                        cycle.end = date;
                    }
                    DayClass::Spotting(pbac) => {
                        let day = CycleDay {
                            date,
                            pbac,
                            spotting: true,
                        };
                        match self.state {
                            CycleState::Open(index) => {
                                let cycle = &mut self.cycles[index];
                                cycle.days.push(day);
                                cycle.end = date;
                            }
                            CycleState::Idle => self.lead_in.push(day),
                        }
                    }
                    _ => {}
                }
            }
        }

        self.prev = Some(date);
    }

    fn finish(self) -> Vec<Cycle> {
        self.cycles
    }
}

/// Sorted `(date, score)` pairs, one per calendar day
fn scored_days(entries: &[DailyEntry]) -> Vec<(NaiveDate, Option<u32>)> {
    let mut days: Vec<(NaiveDate, Option<u32>)> = entries
        .iter()
        .filter_map(|e| e.parsed_date().map(|d| (d, e.day_score())))
        .collect();
    days.sort_by_key(|(date, _)| *date);
    days.dedup_by_key(|(date, _)| *date);
    days
}

/// Reconstruct bleeding cycles from the full entry collection
pub fn detect_cycles(entries: &[DailyEntry], rules: &PbacRules) -> Vec<Cycle> {
    let mut reconstructor = Reconstructor::new(rules);
    for (date, score) in scored_days(entries) {
        reconstructor.advance(date, score);
    }
    let cycles = reconstructor.finish();
    tracing::debug!("Reconstructed {} cycles from {} entries", cycles.len(), entries.len());
    cycles
}

/// Reconstruct cycles and derive the period, start and spotting day sets
pub fn build_period_flags(entries: &[DailyEntry], rules: &PbacRules) -> PeriodFlags {
    let cycles = detect_cycles(entries, rules);
    let mut flags = PeriodFlags::default();

    for (date, score) in scored_days(entries) {
        if matches!(classify(score, rules), DayClass::Spotting(_)) {
            flags.spotting_set.insert(date);
        }
    }

    for cycle in &cycles {
        if let Some(first) = cycle.first_bleeding_day() {
            flags.start_set.insert(first);
        }
        for day in &cycle.days {
            if day.spotting {
                flags.spotting_set.insert(day.date);
            } else {
                flags.period_set.insert(day.date);
            }
        }
    }

    flags.cycles = cycles;
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AbsentReason, PbacRecord};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn entry(day: &str, score: Option<u32>) -> DailyEntry {
        let mut pbac = match score {
            Some(_) => PbacRecord {
                absent_reason: None,
                ..PbacRecord::default()
            },
            None => PbacRecord::absent(AbsentReason::NotAsked),
        };
        pbac.day_score = score;
        DailyEntry::new(date(day)).with_pbac(pbac)
    }

    fn series(start: &str, scores: &[u32]) -> Vec<DailyEntry> {
        let first = date(start);
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let day = first + chrono::Duration::days(i as i64);
                entry(&day.format("%Y-%m-%d").to_string(), Some(*s))
            })
            .collect()
    }

    fn dates(list: &[&str]) -> BTreeSet<NaiveDate> {
        list.iter().map(|d| date(d)).collect()
    }

    #[test]
    fn test_segmentation_example() {
        let entries = series("2024-10-01", &[0, 0, 4, 8, 5, 0, 0, 7]);
        let flags = build_period_flags(&entries, PbacRules::standard());

        assert_eq!(flags.cycles.len(), 2);
        let first = &flags.cycles[0];
        assert_eq!(first.start, date("2024-10-03"));
        assert_eq!(first.end, date("2024-10-05"));
        assert!(first.days[0].spotting);
        assert_eq!(first.pbac_sum, 13);

        let second = &flags.cycles[1];
        assert_eq!(second.start, date("2024-10-08"));
        assert_eq!(second.end, date("2024-10-08"));
        assert_eq!(second.pbac_sum, 7);

        assert_eq!(flags.start_set, dates(&["2024-10-04", "2024-10-08"]));
        assert_eq!(
            flags.period_set,
            dates(&["2024-10-04", "2024-10-05", "2024-10-08"])
        );
        assert!(flags.spotting_set.contains(&date("2024-10-03")));
    }

    #[test]
    fn test_short_zero_blip_reopens_previous_cycle() {
        let entries = series("2024-05-01", &[12, 9, 0, 6]);
        let cycles = detect_cycles(&entries, PbacRules::standard());

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].start, date("2024-05-01"));
        assert_eq!(cycles[0].end, date("2024-05-04"));
        assert_eq!(cycles[0].pbac_sum, 27);
        assert_eq!(cycles[0].len(), 3);
    }

    #[test]
    fn test_spotting_alone_never_opens_a_cycle() {
        let entries = series("2024-05-01", &[0, 3, 2, 0, 0, 1]);
        let flags = build_period_flags(&entries, PbacRules::standard());

        assert!(flags.cycles.is_empty());
        assert!(flags.period_set.is_empty());
        assert_eq!(
            flags.spotting_set,
            dates(&["2024-05-02", "2024-05-03", "2024-05-06"])
        );
    }

    #[test]
    fn test_spotting_tail_joins_open_cycle() {
        let entries = series("2024-06-10", &[20, 15, 3, 2, 0, 0]);
        let cycles = detect_cycles(&entries, PbacRules::standard());

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].end, date("2024-06-13"));
        assert_eq!(cycles[0].pbac_sum, 35);
        assert_eq!(cycles[0].days.iter().filter(|d| d.spotting).count(), 2);
    }

    #[test]
    fn test_missing_scores_do_not_break_a_run() {
        let mut entries = series("2024-07-01", &[10]);
        entries.push(entry("2024-07-02", None));
        entries.push(entry("2024-07-03", Some(8)));
        let cycles = detect_cycles(&entries, PbacRules::standard());

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].pbac_sum, 18);
        assert_eq!(cycles[0].len(), 2);
    }

    #[test]
    fn test_unsorted_and_duplicate_dates() {
        let mut entries = series("2024-08-01", &[10, 10]);
        entries.reverse();
        entries.push(entry("2024-08-01", Some(0)));
        let cycles = detect_cycles(&entries, PbacRules::standard());

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].start, date("2024-08-01"));
    }

    // A one-day hole across a month boundary counts as a single zero day,
    // which is below the new-cycle threshold, so the previous cycle reopens.
    #[test]
    fn test_single_day_gap_across_month_boundary_reopens() {
        let entries = vec![
            entry("2024-09-29", Some(10)),
            entry("2024-09-30", Some(10)),
            entry("2024-10-02", Some(10)),
        ];
        let cycles = detect_cycles(&entries, PbacRules::standard());

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].start, date("2024-09-29"));
        assert_eq!(cycles[0].end, date("2024-10-02"));
    }

    #[test]
    fn test_two_day_gap_across_month_boundary_starts_new_cycle() {
        let entries = vec![
            entry("2024-09-29", Some(10)),
            entry("2024-09-30", Some(10)),
            entry("2024-10-03", Some(10)),
        ];
        let cycles = detect_cycles(&entries, PbacRules::standard());

        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[1].start, date("2024-10-03"));
    }

    #[test]
    fn test_leap_day_boundary() {
        let entries = vec![
            entry("2024-02-28", Some(10)),
            entry("2024-03-01", Some(10)),
        ];
        // 2024-02-29 exists, so the gap is one missing day
        assert_eq!(detect_cycles(&entries, PbacRules::standard()).len(), 1);

        let entries = vec![
            entry("2023-02-27", Some(10)),
            entry("2023-03-02", Some(10)),
        ];
        assert_eq!(detect_cycles(&entries, PbacRules::standard()).len(), 2);
    }

    #[test]
    fn test_custom_min_gap() {
        let rules = PbacRules {
            min_zeros_before_new_bleed: 4,
            ..PbacRules::default()
        };
        let entries = series("2024-01-01", &[10, 0, 0, 0, 10]);
        assert_eq!(detect_cycles(&entries, &rules).len(), 1);
        assert_eq!(detect_cycles(&entries, PbacRules::standard()).len(), 2);
    }

    #[test]
    fn test_invalid_dates_are_ignored() {
        let mut entries = series("2024-01-01", &[10]);
        entries.push(DailyEntry {
            date: "not-a-date".into(),
            pbac: None,
            fields: Default::default(),
        });
        assert_eq!(detect_cycles(&entries, PbacRules::standard()).len(), 1);
    }
}
