//! Pass history and statistics for the administrative dashboard
//!
//! Works over a registry snapshot, so a query never holds the registry lock
//! while filtering or paginating.

use crate::domain::error::{GateError, GateResult};
use crate::domain::pass::{EntryCode, Pass, PassStatus, Plate};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 500;

/// Pass counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub total: usize,
    pub pending: usize,
    pub inside: usize,
    pub exited: usize,
}

pub fn stats(passes: &[Pass]) -> PassStats {
    passes.iter().fold(PassStats::default(), |mut acc, pass| {
        acc.total += 1;
        match pass.status() {
            PassStatus::Pending => acc.pending += 1,
            PassStatus::Inside => acc.inside += 1,
            PassStatus::Exited => acc.exited += 1,
        }
        acc
    })
}

/// History filter and page selection
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub search: Option<String>,
    pub status: Option<PassStatus>,
    /// Inclusive lower bound on entry time
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on entry time
    pub to: Option<DateTime<Utc>>,
    pub page: u32,
    pub limit: u32,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self { search: None, status: None, from: None, to: None, page: 1, limit: DEFAULT_LIMIT }
    }
}

#[derive(Clone, Copy)]
enum Bound {
    Start,
    End,
}

/// RFC 3339 timestamp, or a bare `YYYY-MM-DD` date covering the whole day
fn parse_bound(raw: &str, bound: Bound) -> GateResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| GateError::InvalidInput(format!("invalid date '{raw}'")))?;
    let naive = match bound {
        Bound::Start => date.and_hms_opt(0, 0, 0),
        Bound::End => date.and_hms_nano_opt(23, 59, 59, 999_999_999),
    }
    .ok_or_else(|| GateError::InvalidInput(format!("invalid date '{raw}'")))?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn parse_number(key: &str, raw: &str) -> GateResult<u32> {
    raw.parse()
        .map_err(|_| GateError::InvalidInput(format!("{key} must be a positive integer")))
}

impl HistoryQuery {
    /// Parse `search`, `status`, `from`, `to`, `page` and `limit` from a URL
    /// query string. Unknown keys and empty values are ignored.
    pub fn from_query_string(query: &str) -> GateResult<Self> {
        let mut q = HistoryQuery::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "search" => q.search = Some(value.to_string()),
                "status" => q.status = Some(value.parse().map_err(GateError::InvalidInput)?),
                "from" => q.from = Some(parse_bound(value, Bound::Start)?),
                "to" => q.to = Some(parse_bound(value, Bound::End)?),
                "page" => q.page = parse_number("page", value)?.max(1),
                "limit" => q.limit = parse_number("limit", value)?.clamp(1, MAX_LIMIT),
                _ => {}
            }
        }
        Ok(q)
    }

    fn matches(&self, pass: &Pass) -> bool {
        if let Some(status) = self.status {
            if pass.status() != status {
                return false;
            }
        }

        if self.from.is_some() || self.to.is_some() {
            let Some(entry) = pass.entry_time() else {
                return false;
            };
            if self.from.is_some_and(|from| entry < from) || self.to.is_some_and(|to| entry > to) {
                return false;
            }
        }

        match &self.search {
            Some(term) => {
                let term = term.to_lowercase();
                pass.guest_name().to_lowercase().contains(&term)
                    || pass.host_name().to_lowercase().contains(&term)
                    || pass.entry_code().as_str().contains(&term)
                    || pass.plate().is_some_and(|p| p.as_str().to_lowercase().contains(&term))
            }
            None => true,
        }
    }
}

/// History row without image payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub id: Uuid,
    pub entry_code: EntryCode,
    pub guest_name: String,
    pub host_name: String,
    pub unit: String,
    pub plate: Option<Plate>,
    pub status: PassStatus,
    pub created_at: DateTime<Utc>,
    pub entry_time: Option<DateTime<Utc>>,
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition_confidence: Option<f32>,
    pub has_images: bool,
}

impl From<&Pass> for PassSummary {
    fn from(pass: &Pass) -> Self {
        Self {
            id: pass.id(),
            entry_code: pass.entry_code().clone(),
            guest_name: pass.guest_name().to_string(),
            host_name: pass.host_name().to_string(),
            unit: pass.unit().to_string(),
            plate: pass.plate().cloned(),
            status: pass.status(),
            created_at: pass.created_at(),
            entry_time: pass.entry_time(),
            exit_time: pass.exit_time(),
            recognition_confidence: pass.recognition_confidence(),
            has_images: pass.has_images(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub logs: Vec<PassSummary>,
    pub total: usize,
    pub page: u32,
    pub total_pages: u32,
}

/// Filter, order newest first by creation time, and paginate
pub fn history(passes: &[Pass], query: &HistoryQuery) -> HistoryPage {
    let mut matching: Vec<&Pass> = passes.iter().filter(|p| query.matches(p)).collect();
    matching.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then_with(|| b.id().cmp(&a.id())));

    let limit = query.limit.clamp(1, MAX_LIMIT);
    let page = query.page.max(1);
    let total = matching.len();
    let total_pages = total.div_ceil(limit as usize) as u32;
    let start = (page as usize - 1).saturating_mul(limit as usize);

    let logs = matching.into_iter().skip(start).take(limit as usize).map(PassSummary::from).collect();
    HistoryPage { logs, total, page, total_pages }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Duration;

    fn pass(code: &str, guest: &str, created: DateTime<Utc>) -> Pass {
        Pass::new(EntryCode::new(code), guest, "J. Doe", "101", created)
    }

    fn inside(mut pass: Pass, plate: &str, entry: DateTime<Utc>) -> Pass {
        pass.status = PassStatus::Inside;
        pass.plate = Plate::parse(plate);
        pass.entry_time = Some(entry);
        pass
    }

    fn fixture() -> Vec<Pass> {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut exited = inside(pass("100003", "Carol", t0 + Duration::hours(2)), "MH12XY9876", t0 + Duration::hours(3));
        exited.status = PassStatus::Exited;
        exited.exit_time = Some(t0 + Duration::hours(5));
        exited.plate_image = Some(Bytes::from_static(b"crop"));

        vec![
            pass("100001", "A. Smith", t0),
            inside(pass("100002", "Bob", t0 + Duration::hours(1)), "KA01AB1234", t0 + Duration::days(1)),
            exited,
        ]
    }

    #[test]
    fn test_stats_counts_by_status() {
        let stats = stats(&fixture());
        assert_eq!(stats, PassStats { total: 3, pending: 1, inside: 1, exited: 1 });
    }

    #[test]
    fn test_history_newest_first_without_images() {
        let page = history(&fixture(), &HistoryQuery::default());
        let codes: Vec<&str> = page.logs.iter().map(|l| l.entry_code.as_str()).collect();
        assert_eq!(codes, ["100003", "100002", "100001"]);
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 1);
        assert!(page.logs[0].has_images);

        let json = serde_json::to_value(&page).unwrap();
        assert!(json["logs"][0].get("plateImage").is_none());
        assert_eq!(json["totalPages"], 1);
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let query = HistoryQuery::from_query_string("search=ka01").unwrap();
        let page = history(&fixture(), &query);
        assert_eq!(page.total, 1);
        assert_eq!(page.logs[0].entry_code.as_str(), "100002");

        let query = HistoryQuery::from_query_string("search=smith").unwrap();
        assert_eq!(history(&fixture(), &query).logs[0].guest_name, "A. Smith");
    }

    #[test]
    fn test_date_bounds_exclude_passes_without_entry() {
        let query = HistoryQuery::from_query_string("from=2026-03-01&to=2026-03-01").unwrap();
        let page = history(&fixture(), &query);
        assert_eq!(page.total, 1);
        assert_eq!(page.logs[0].entry_code.as_str(), "100003");

        let query = HistoryQuery::from_query_string("from=2026-03-02T00:00:00Z").unwrap();
        assert_eq!(history(&fixture(), &query).logs[0].entry_code.as_str(), "100002");
    }

    #[test]
    fn test_status_filter_and_pagination() {
        let query = HistoryQuery::from_query_string("status=pending").unwrap();
        assert_eq!(history(&fixture(), &query).total, 1);

        let query = HistoryQuery::from_query_string("limit=2&page=2").unwrap();
        let page = history(&fixture(), &query);
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.logs.len(), 1);
        assert_eq!(page.logs[0].entry_code.as_str(), "100001");

        let query = HistoryQuery::from_query_string("page=9").unwrap();
        assert!(history(&fixture(), &query).logs.is_empty());
    }

    #[test]
    fn test_query_parsing_limits_and_errors() {
        let query = HistoryQuery::from_query_string("limit=100000&page=0&unknown=x&search=").unwrap();
        assert_eq!(query.limit, 500);
        assert_eq!(query.page, 1);
        assert!(query.search.is_none());

        assert!(matches!(HistoryQuery::from_query_string("from=yesterday"), Err(GateError::InvalidInput(_))));
        assert!(matches!(HistoryQuery::from_query_string("status=gone"), Err(GateError::InvalidInput(_))));
        assert!(matches!(HistoryQuery::from_query_string("limit=-1"), Err(GateError::InvalidInput(_))));
    }
}
