/// Counters snapshot broadcast to monitors and rendered into stats.html.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MasterStats {
    pub packages_tracked: i64,
    pub versions_tracked: i64,
    pub versions_skipped: i64,
    pub builds_total: i64,
    pub builds_last_hour: i64,
    pub builds_pending: i64,
    pub files_count: i64,
    pub downloads_total: i64,
    pub downloads_last_month: i64,
}
