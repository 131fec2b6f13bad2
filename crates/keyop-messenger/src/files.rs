use chrono::{NaiveDate, Utc};
use keyop_core::Os;
use std::path::Path;

pub fn day_file_name(date: NaiveDate) -> String {
    format!("{}.jsonl", date.format("%Y%m%d"))
}

pub fn parse_day_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stem, "%Y%m%d").ok()
}

/// Every day file currently present in a channel directory, oldest
/// first.
pub fn list_day_files(os: &dyn Os, channel_dir: &Path) -> Vec<(String, NaiveDate)> {
    let entries = os.read_dir(channel_dir).unwrap_or_default();
    let mut files: Vec<(String, NaiveDate)> = entries
        .into_iter()
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?.to_string();
            let date = parse_day_file_name(&name)?;
            Some((name, date))
        })
        .collect();
    files.sort_by_key(|(_, date)| *date);
    files
}

/// The oldest existing day file whose date is within `max_age` of
/// `now`, if any.
pub fn oldest_file_within_max_age(
    os: &dyn Os,
    channel_dir: &Path,
    max_age: chrono::Duration,
    now: chrono::DateTime<Utc>,
) -> Option<String> {
    let cutoff = (now - max_age).date_naive();
    list_day_files(os, channel_dir)
        .into_iter()
        .find(|(_, date)| *date >= cutoff)
        .map(|(name, _)| name)
}

/// The newest existing day file, if any.
pub fn newest_file(os: &dyn Os, channel_dir: &Path) -> Option<String> {
    list_day_files(os, channel_dir).pop().map(|(name, _)| name)
}

/// A day file newer than `after`, if one already exists (used to
/// detect UTC day rollover once the current file is drained).
pub fn next_file_after(os: &dyn Os, channel_dir: &Path, after: &str) -> Option<String> {
    let after_date = parse_day_file_name(after)?;
    list_day_files(os, channel_dir)
        .into_iter()
        .find(|(_, date)| *date > after_date)
        .map(|(name, _)| name)
}
