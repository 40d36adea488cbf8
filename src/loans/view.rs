use crate::error::ErrorReport;
use crate::loans::types::{
    LoanId, LoanRecord, PollSnapshot, SymbolFilter, ViewFilter, ViewSnapshot, ViewSummary,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Client-side state derived from the polled record set: the filter, the
/// filtered view, the selection and the close-command flag.
///
/// The selection is always a subset of the ids in the filtered view; every
/// change to records or filter prunes it.
#[derive(Debug)]
pub struct ViewState {
    records: Arc<Vec<LoanRecord>>,
    filter: ViewFilter,
    visible: Vec<usize>,
    selection: HashSet<LoanId>,
    replaced_selection: Option<HashSet<LoanId>>,
    close_in_flight: bool,
    command_error: Option<ErrorReport>,
}

impl ViewState {
    pub fn new(filter: ViewFilter) -> Self {
        Self {
            records: Arc::new(Vec::new()),
            filter,
            visible: Vec::new(),
            selection: HashSet::new(),
            replaced_selection: None,
            close_in_flight: false,
            command_error: None,
        }
    }

    /// Adopts a new authoritative record set. Returns `false` when it is the
    /// set already shown.
    pub fn sync_records(&mut self, records: Arc<Vec<LoanRecord>>) -> bool {
        if Arc::ptr_eq(&self.records, &records) {
            return false;
        }
        self.records = records;
        self.refilter();
        true
    }

    pub fn set_filter(&mut self, filter: ViewFilter) {
        if self.filter == filter {
            return;
        }
        self.filter = filter;
        self.refilter();
    }

    pub fn set_symbol_filter(&mut self, symbol: SymbolFilter) {
        let filter = ViewFilter {
            symbol,
            min_rate: self.filter.min_rate,
        };
        self.set_filter(filter);
    }

    pub fn set_min_rate_filter(&mut self, min_rate: Option<f64>) {
        let filter = ViewFilter {
            symbol: self.filter.symbol.clone(),
            min_rate,
        };
        self.set_filter(filter);
    }

    fn refilter(&mut self) {
        let filter = &self.filter;
        self.visible = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| filter.matches(record))
            .map(|(index, _)| index)
            .collect();

        let records = &self.records;
        let visible_ids: HashSet<&LoanId> = self
            .visible
            .iter()
            .map(|&index| &records[index].id)
            .collect();
        self.selection.retain(|id| visible_ids.contains(id));
        self.replaced_selection = None;
    }

    pub fn visible_records(&self) -> impl Iterator<Item = &LoanRecord> + '_ {
        self.visible.iter().map(|&index| &self.records[index])
    }

    pub fn visible_ids(&self) -> Vec<LoanId> {
        self.visible_records()
            .map(|record| record.id.clone())
            .collect()
    }

    pub fn is_visible(&self, id: &LoanId) -> bool {
        self.visible_records().any(|record| &record.id == id)
    }

    /// Selected ids in filtered-view order.
    pub fn selected_ids(&self) -> Vec<LoanId> {
        self.visible_records()
            .filter(|record| self.selection.contains(&record.id))
            .map(|record| record.id.clone())
            .collect()
    }

    pub fn all_selected(&self) -> bool {
        !self.visible.is_empty() && self.selection.len() == self.visible.len()
    }

    /// Flips one row. Ids outside the filtered view are ignored. Returns
    /// whether the id is selected afterwards.
    pub fn toggle_selection(&mut self, id: &LoanId) -> bool {
        if !self.is_visible(id) {
            return false;
        }
        self.replaced_selection = None;
        if self.selection.remove(id) {
            false
        } else {
            self.selection.insert(id.clone());
            true
        }
    }

    /// Selects every visible row, or, when they already are all selected,
    /// goes back to the selection that select-all replaced (empty if none).
    pub fn select_all_or_none(&mut self) {
        let visible_ids: HashSet<LoanId> = self.visible_ids().into_iter().collect();
        if self.selection == visible_ids {
            self.selection = self.replaced_selection.take().unwrap_or_default();
        } else {
            let previous = std::mem::replace(&mut self.selection, visible_ids);
            self.replaced_selection = Some(previous);
        }
    }

    pub fn close_in_flight(&self) -> bool {
        self.close_in_flight
    }

    pub fn command_error(&self) -> Option<&ErrorReport> {
        self.command_error.as_ref()
    }

    /// Marks a close as in flight and hands back its payload, or `None` when
    /// nothing is selected or a close is already running.
    pub fn begin_close(&mut self) -> Option<Vec<LoanId>> {
        if self.close_in_flight || self.selection.is_empty() {
            return None;
        }
        self.close_in_flight = true;
        self.command_error = None;
        Some(self.selected_ids())
    }

    pub fn complete_close(&mut self, result: Result<(), ErrorReport>) {
        self.close_in_flight = false;
        match result {
            Ok(()) => {
                self.selection.clear();
                self.replaced_selection = None;
                self.command_error = None;
            }
            Err(report) => self.command_error = Some(report),
        }
    }

    /// Clears the in-flight flag of a close whose outcome is unknown, leaving
    /// the selection for a retry.
    pub fn abort_close(&mut self) {
        self.close_in_flight = false;
    }

    pub fn summary(&self) -> ViewSummary {
        let mut summary = ViewSummary {
            count: 0,
            total_amount: 0.0,
            average_rate: None,
            daily_earnings: 0.0,
            annual_earnings: 0.0,
        };
        let mut weighted_rate = 0.0;

        for record in self.visible_records() {
            summary.count += 1;
            summary.total_amount += record.amount;
            weighted_rate += record.amount * record.rate;
            summary.daily_earnings += record.daily_earnings.unwrap_or(0.0);
            summary.annual_earnings += record.annual_earnings.unwrap_or(0.0);
        }

        if summary.total_amount > 0.0 {
            summary.average_rate = Some(weighted_rate / summary.total_amount);
        }
        summary
    }

    /// Distinct symbols of the whole record set, for the symbol selector.
    pub fn symbols(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|record| record.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn snapshot(&self, poll: &PollSnapshot) -> ViewSnapshot {
        ViewSnapshot {
            state: poll.state,
            filter: self.filter.clone(),
            rows: self.visible_records().cloned().collect(),
            selected_ids: self.selected_ids(),
            all_selected: self.all_selected(),
            close_in_flight: self.close_in_flight,
            summary: self.summary(),
            symbols: self.symbols(),
            fetch_error: poll.error.clone(),
            command_error: self.command_error.clone(),
            resolved_sequence: poll.resolved_sequence,
            last_success_ms: poll.last_success_ms,
        }
    }
}
