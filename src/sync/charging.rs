use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, Duration, Utc};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::coalesce::InFlight;
use super::source::ChargingHistorySource;
use super::store::Store;
use crate::client::error::ClientError;
use crate::client::storage::LocalStore;
use crate::models::charging::{ChargingSession, merge_sessions};

/// Local-store key of the persisted per-VIN cache.
pub const HISTORY_CACHE_KEY: &str = "vf_charging_history";

/// Tunables of a [`ChargingHistoryCache`].
#[derive(Clone, Debug)]
pub struct HistorySettings {
    pub page_size: u32,
    /// Pages requested concurrently after the first one.
    pub fan_out: usize,
    pub ttl: Duration,
    /// VIN entries kept in the persisted cache.
    pub max_vins: usize,
    /// Upper bound on pages requested for one VIN.
    pub max_pages: u32,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            fan_out: 4,
            ttl: Duration::hours(24),
            max_vins: 5,
            max_pages: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    All,
    Year,
    Month,
}

/// Time range selected for display. `year` and `month` are 0 when unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeFilter {
    pub mode: FilterMode,
    pub year: i32,
    pub month: u32,
}

impl TimeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn year(year: i32) -> Self {
        Self {
            mode: FilterMode::Year,
            year,
            month: 0,
        }
    }

    pub fn month(year: i32, month: u32) -> Self {
        Self {
            mode: FilterMode::Month,
            year,
            month,
        }
    }

    pub fn matches(&self, session: &ChargingSession) -> bool {
        match self.mode {
            FilterMode::All => true,
            FilterMode::Year => session.falls_in(self.year, None),
            FilterMode::Month => session.falls_in(self.year, Some(self.month)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthEntry {
    pub year: i32,
    pub month: u32,
    /// e.g. `T3/2025`.
    pub label: String,
}

/// What the charging history view renders.
#[derive(Debug, Clone, Default)]
pub struct ChargingHistoryState {
    /// Sessions passing the current filter.
    pub sessions: Vec<ChargingSession>,
    /// Every session loaded so far for `loaded_vin`.
    pub all_sessions: Vec<ChargingSession>,
    pub total_loaded: usize,
    pub total_records: u64,
    pub is_loading: bool,
    /// Remaining pages are still being fetched.
    pub is_loading_more: bool,
    pub error: Option<String>,
    /// Set when some pages failed and the list is incomplete.
    pub warning: Option<String>,
    /// Newest first.
    pub available_years: Vec<i32>,
    /// Months of the selected year, newest first.
    pub available_months: Vec<MonthEntry>,
    pub filter: TimeFilter,
    pub loaded_vin: Option<String>,
}

/// Persisted history of one VIN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VinCacheEntry {
    pub sessions: Vec<ChargingSession>,
    pub total_records: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub fetched_at: DateTime<Utc>,
}

/// Month if any session is in the current month, else year if any is in
/// the current year, else all.
pub fn smart_default(sessions: &[ChargingSession], now: DateTime<Utc>) -> TimeFilter {
    let (year, month) = (now.year(), now.month());
    if sessions.iter().any(|s| s.falls_in(year, Some(month))) {
        TimeFilter::month(year, month)
    } else if sessions.iter().any(|s| s.falls_in(year, None)) {
        TimeFilter::year(year)
    } else {
        TimeFilter::all()
    }
}

fn available_years(sessions: &[ChargingSession]) -> Vec<i32> {
    let years: BTreeSet<i32> = sessions
        .iter()
        .filter_map(|s| s.session_time())
        .map(|t| t.year())
        .collect();
    years.into_iter().rev().collect()
}

fn available_months(sessions: &[ChargingSession], year: i32) -> Vec<MonthEntry> {
    if year <= 0 {
        return Vec::new();
    }
    let months: BTreeSet<u32> = sessions
        .iter()
        .filter_map(|s| s.session_time())
        .filter(|t| t.year() == year)
        .map(|t| t.month())
        .collect();
    months
        .into_iter()
        .rev()
        .map(|month| MonthEntry {
            year,
            month,
            label: format!("T{}/{}", month, year),
        })
        .collect()
}

/// Shows `all` through `filter`, recomputing the year and month pickers.
fn apply_filter(state: &mut ChargingHistoryState, all: Vec<ChargingSession>, filter: TimeFilter) {
    state.sessions = all.iter().filter(|s| filter.matches(s)).cloned().collect();
    state.total_loaded = all.len();
    state.available_years = available_years(&all);
    state.available_months = available_months(&all, filter.year);
    state.filter = filter;
    state.all_sessions = all;
}

/// Drops expired entries, then the least recently fetched beyond `max_vins`.
fn prune(entries: &mut HashMap<String, VinCacheEntry>, settings: &HistorySettings, now: DateTime<Utc>) {
    entries.retain(|_, e| now - e.fetched_at < settings.ttl);
    if entries.len() > settings.max_vins {
        let mut by_age: Vec<(String, DateTime<Utc>)> = entries
            .iter()
            .map(|(vin, e)| (vin.clone(), e.fetched_at))
            .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1));
        for (vin, _) in by_age.into_iter().skip(settings.max_vins) {
            entries.remove(&vin);
        }
    }
}

struct Inner {
    source: Arc<dyn ChargingHistorySource>,
    storage: Arc<dyn LocalStore>,
    settings: HistorySettings,
    store: Store<ChargingHistoryState>,
    entries: RwLock<HashMap<String, VinCacheEntry>>,
    in_flight: InFlight<Result<(), ClientError>>,
    /// Bumped by every `fetch`; the highest value is the latest request.
    requests: AtomicU64,
}

/// Paginated charging history with a persisted per-VIN cache.
#[derive(Clone)]
pub struct ChargingHistoryCache {
    inner: Arc<Inner>,
}

impl ChargingHistoryCache {
    /// Loads the persisted cache; unreadable data is discarded.
    pub fn new(
        source: Arc<dyn ChargingHistorySource>,
        storage: Arc<dyn LocalStore>,
        settings: HistorySettings,
    ) -> Self {
        let mut entries: HashMap<String, VinCacheEntry> = match storage.get(HISTORY_CACHE_KEY) {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Discarding unreadable charging cache: {}", e);
                storage.remove(HISTORY_CACHE_KEY);
                HashMap::new()
            }),
            None => HashMap::new(),
        };
        prune(&mut entries, &settings, Utc::now());

        Self {
            inner: Arc::new(Inner {
                source,
                storage,
                settings,
                store: Store::default(),
                entries: RwLock::new(entries),
                in_flight: InFlight::new(),
                requests: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Store<ChargingHistoryState> {
        &self.inner.store
    }

    pub fn state(&self) -> ChargingHistoryState {
        self.inner.store.get()
    }

    /// Loads the history of `vin`, from cache when fresh unless `force`.
    /// Concurrent calls for one VIN share a single load.
    pub async fn fetch(&self, vin: &str, force: bool) -> Result<(), ClientError> {
        let ticket = self.inner.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        let key = vin.to_string();
        self.inner
            .in_flight
            .run(vin, move || async move { inner.load(&key, force).await })
            .await?;

        // A joined load skips its view updates while another VIN is shown.
        self.inner.show_if_latest(vin, ticket).await;
        Ok(())
    }

    /// Changes the visible time range over what is loaded.
    pub fn set_filter(&self, filter: TimeFilter) {
        self.inner.store.update(|s| {
            let all = std::mem::take(&mut s.all_sessions);
            apply_filter(s, all, filter);
        });
    }

    pub async fn cached_entry(&self, vin: &str) -> Option<VinCacheEntry> {
        self.inner.entries.read().await.get(vin).cloned()
    }
}

impl Inner {
    /// Puts the cached history of `vin` on display when no newer `fetch`
    /// has started and the view still shows another VIN.
    async fn show_if_latest(&self, vin: &str, ticket: u64) {
        let Some(entry) = self.entries.read().await.get(vin).cloned() else {
            return;
        };
        let now = Utc::now();
        self.store.update(|s| {
            if self.requests.load(Ordering::SeqCst) != ticket || s.loaded_vin.as_deref() == Some(vin) {
                return;
            }
            tracing::debug!("💾 Showing charging history of {} after a shared load", vin);
            s.loaded_vin = Some(vin.to_string());
            s.total_records = entry.total_records;
            s.error = None;
            s.warning = None;
            s.is_loading = false;
            s.is_loading_more = false;
            let filter = smart_default(&entry.sessions, now);
            apply_filter(s, entry.sessions, filter);
        });
    }

    async fn load(&self, vin: &str, force: bool) -> Result<(), ClientError> {
        let now = Utc::now();
        let (vin_changed, other_vin) = self.store.read(|s| match s.loaded_vin.as_deref() {
            Some(loaded) => (loaded != vin, loaded != vin),
            None => (false, true),
        });

        let cached = self
            .entries
            .read()
            .await
            .get(vin)
            .filter(|e| now - e.fetched_at < self.settings.ttl && !e.sessions.is_empty())
            .cloned();

        if let (false, Some(entry)) = (force, cached) {
            tracing::debug!("💾 Charging history for {} served from cache", vin);
            self.store.update(|s| {
                let filter = if other_vin {
                    smart_default(&entry.sessions, now)
                } else {
                    s.filter
                };
                s.loaded_vin = Some(vin.to_string());
                s.total_records = entry.total_records;
                s.error = None;
                s.warning = None;
                s.is_loading = false;
                s.is_loading_more = false;
                apply_filter(s, entry.sessions, filter);
            });
            return Ok(());
        }

        self.store.update(|s| {
            if vin_changed {
                apply_filter(s, Vec::new(), TimeFilter::all());
                s.total_records = 0;
            }
            s.is_loading = true;
            s.is_loading_more = false;
            s.error = None;
            s.warning = None;
            s.loaded_vin = Some(vin.to_string());
        });

        let size = self.settings.page_size.max(1);
        let first = match self.source.history_page(vin, 0, size).await {
            Ok(page) => page,
            Err(e) => {
                tracing::error!("❌ Charging history failed for {}: {}", vin, e);
                self.store.update(|s| {
                    if s.loaded_vin.as_deref() == Some(vin) {
                        s.error = Some(e.to_string());
                        s.is_loading = false;
                    }
                });
                return Err(e);
            }
        };

        let total_records = first.total_records.max(first.sessions.len() as u64);
        let first_sessions = merge_sessions([first.sessions]);
        tracing::info!(
            "🔌 Charging history {}: page 0 → {} sessions, total {}",
            vin,
            first_sessions.len(),
            total_records
        );

        self.store.update(|s| {
            if s.loaded_vin.as_deref() == Some(vin) {
                s.total_records = total_records;
                s.is_loading = false;
                let filter = smart_default(&first_sessions, now);
                apply_filter(s, first_sessions.clone(), filter);
            }
        });

        let mut all = first_sessions;
        if (all.len() as u64) < total_records {
            self.store.update(|s| {
                if s.loaded_vin.as_deref() == Some(vin) {
                    s.is_loading_more = true;
                }
            });

            let needed = u32::try_from(total_records.div_ceil(size as u64)).unwrap_or(u32::MAX);
            let pages = needed.min(self.settings.max_pages.max(1));
            if pages < needed {
                tracing::warn!(
                    "⚠️ Charging history for {} spans {} pages, loading the first {}",
                    vin,
                    needed,
                    pages
                );
            }
            let results: Vec<(u32, Result<Vec<ChargingSession>, ClientError>)> =
                stream::iter(1..pages)
                    .map(|page| {
                        let source = self.source.clone();
                        let vin = vin.to_string();
                        async move {
                            let result = source
                                .history_page(&vin, page, size)
                                .await
                                .map(|p| p.sessions);
                            (page, result)
                        }
                    })
                    .buffered(self.settings.fan_out.max(1))
                    .collect()
                    .await;

            let mut lists = vec![all];
            let mut failed = Vec::new();
            for (page, result) in results {
                match result {
                    Ok(sessions) => lists.push(sessions),
                    Err(e) => {
                        tracing::warn!("⚠️ Charging history page {} for {} failed: {}", page, vin, e);
                        failed.push(page);
                    }
                }
            }
            all = merge_sessions(lists);

            let warning = (!failed.is_empty()).then(|| {
                format!(
                    "Loaded {} of {} pages, some charging sessions may be missing",
                    pages as usize - failed.len(),
                    pages
                )
            });

            self.store.update(|s| {
                if s.loaded_vin.as_deref() == Some(vin) {
                    s.is_loading_more = false;
                    s.warning = warning;
                    let filter = s.filter;
                    apply_filter(s, all.clone(), filter);
                }
            });
        }

        self.persist(
            vin,
            VinCacheEntry {
                sessions: all,
                total_records,
                fetched_at: Utc::now(),
            },
        )
        .await;
        Ok(())
    }

    async fn persist(&self, vin: &str, entry: VinCacheEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(vin.to_string(), entry);
        prune(&mut entries, &self.settings, Utc::now());

        match serde_json::to_string(&*entries) {
            Ok(raw) => {
                if let Err(e) = self.storage.set(HISTORY_CACHE_KEY, &raw) {
                    tracing::warn!("⚠️ Could not persist charging history: {}", e);
                }
            }
            Err(e) => tracing::warn!("⚠️ Could not serialize charging history: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::storage::MemoryStore;
    use crate::models::charging::HistoryPage;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session(id: &str, at: DateTime<Utc>) -> ChargingSession {
        ChargingSession {
            id: Some(id.to_string()),
            start_charge_time: at.timestamp_millis(),
            ..Default::default()
        }
    }

    fn long_ago(i: usize) -> DateTime<Utc> {
        Utc::now() - Duration::days(800 + i as i64)
    }

    /// Serves `total` sessions in pages, failing the pages in `failing`.
    struct PagedSource {
        sessions: Vec<ChargingSession>,
        failing: HashSet<u32>,
        /// Extra delay before answering any page after the first.
        later_pages_delay_ms: u64,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl PagedSource {
        fn new(sessions: Vec<ChargingSession>) -> Self {
            Self {
                sessions,
                failing: HashSet::new(),
                later_pages_delay_ms: 0,
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChargingHistorySource for PagedSource {
        async fn history_page(
            &self,
            _vin: &str,
            page: u32,
            size: u32,
        ) -> Result<HistoryPage, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if page > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.later_pages_delay_ms)).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&page) {
                return Err(ClientError::ServerError);
            }
            let start = (page * size) as usize;
            let end = (start + size as usize).min(self.sessions.len());
            Ok(HistoryPage {
                sessions: self.sessions.get(start..end).unwrap_or_default().to_vec(),
                total_records: self.sessions.len() as u64,
            })
        }
    }

    fn cache_for(source: Arc<PagedSource>, storage: Arc<dyn LocalStore>) -> ChargingHistoryCache {
        ChargingHistoryCache::new(source, storage, HistorySettings::default())
    }

    #[test]
    fn smart_default_prefers_month_then_year_then_all() {
        let now = Utc::now();
        let mut first_page: Vec<_> = (0..100).map(|i| session(&i.to_string(), long_ago(i))).collect();
        assert_eq!(smart_default(&first_page, now), TimeFilter::all());

        first_page[37] = session("37", now);
        let filter = smart_default(&first_page, now);
        assert_eq!(filter, TimeFilter::month(now.year(), now.month()));
        assert!(filter.matches(&first_page[37]));

        let other_month = if now.month() == 1 { 2 } else { 1 };
        let earlier = chrono::NaiveDate::from_ymd_opt(now.year(), other_month, 10)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .unwrap()
            .and_utc();
        first_page[37] = session("37", earlier);
        assert_eq!(smart_default(&first_page, now), TimeFilter::year(now.year()));
    }

    #[test]
    fn month_labels_are_newest_first() {
        let at = |y, m| {
            chrono::NaiveDate::from_ymd_opt(y, m, 15)
                .and_then(|d| d.and_hms_opt(12, 0, 0))
                .unwrap()
                .and_utc()
        };
        let sessions = vec![
            session("a", at(2025, 1)),
            session("b", at(2025, 3)),
            session("c", at(2024, 12)),
        ];
        assert_eq!(available_years(&sessions), vec![2025, 2024]);
        let labels: Vec<_> = available_months(&sessions, 2025)
            .into_iter()
            .map(|m| m.label)
            .collect();
        assert_eq!(labels, vec!["T3/2025", "T1/2025"]);
        assert!(available_months(&sessions, 0).is_empty());
    }

    #[tokio::test]
    async fn failed_page_keeps_the_rest_and_warns() {
        let sessions: Vec<_> = (0..450).map(|i| session(&format!("s{}", i), long_ago(i))).collect();
        let mut source = PagedSource::new(sessions);
        source.failing.insert(3);
        let source = Arc::new(source);
        let storage: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let cache = cache_for(source.clone(), storage.clone());

        cache.fetch("VIN1", false).await.unwrap();

        let state = cache.state();
        assert_eq!(state.error, None);
        assert!(state.warning.is_some());
        assert_eq!(state.total_records, 450);
        assert_eq!(state.total_loaded, 350);
        assert!(!state.all_sessions.iter().any(|s| s.id.as_deref() == Some("s320")));
        assert!(state.all_sessions.iter().any(|s| s.id.as_deref() == Some("s420")));
        assert!(source.max_concurrent.load(Ordering::SeqCst) <= 4);
        assert_eq!(cache.cached_entry("VIN1").await.unwrap().sessions.len(), 350);
        assert!(storage.get(HISTORY_CACHE_KEY).is_some());
    }

    #[test]
    fn overlapping_pages_are_deduplicated() {
        let first: Vec<_> = (0..10).map(|i| session(&format!("s{}", i), long_ago(i))).collect();
        let second: Vec<_> = (5..15).map(|i| session(&format!("s{}", i), long_ago(i))).collect();
        assert_eq!(merge_sessions([first, second]).len(), 15);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_load_and_cache_hits_skip_network() {
        let sessions: Vec<_> = (0..150).map(|i| session(&format!("s{}", i), long_ago(i))).collect();
        let source = Arc::new(PagedSource::new(sessions));
        let cache = cache_for(source.clone(), Arc::new(MemoryStore::new()));

        let (a, b) = tokio::join!(cache.fetch("VIN1", false), cache.fetch("VIN1", false));
        a.unwrap();
        b.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        cache.fetch("VIN1", false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.state().total_loaded, 150);

        cache.fetch("VIN1", true).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn filter_survives_background_pages_and_reloads() {
        let now = Utc::now();
        let mut sessions: Vec<_> = (0..250).map(|i| session(&format!("s{}", i), long_ago(i))).collect();
        sessions[3] = session("recent", now);
        let source = Arc::new(PagedSource::new(sessions));
        let storage: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let cache = cache_for(source.clone(), storage.clone());

        cache.fetch("VIN1", false).await.unwrap();
        let state = cache.state();
        assert_eq!(state.filter, TimeFilter::month(now.year(), now.month()));
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.total_loaded, 250);

        cache.set_filter(TimeFilter::all());
        assert_eq!(cache.state().sessions.len(), 250);

        let reloaded = cache_for(source.clone(), storage);
        reloaded.fetch("VIN1", false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(reloaded.state().total_loaded, 250);
    }

    #[tokio::test]
    async fn filter_chosen_while_pages_load_is_kept() {
        let now = Utc::now();
        let mut sessions: Vec<_> = (0..300).map(|i| session(&format!("s{}", i), long_ago(i))).collect();
        sessions[0] = session("recent", now);
        let mut source = PagedSource::new(sessions);
        source.later_pages_delay_ms = 100;
        let cache = cache_for(Arc::new(source), Arc::new(MemoryStore::new()));

        let loading = tokio::spawn({
            let cache = cache.clone();
            async move { cache.fetch("VIN1", false).await }
        });
        let mut changes = cache.store().subscribe();
        changes
            .wait_for(|s| s.is_loading_more)
            .await
            .unwrap();
        assert_eq!(cache.state().filter, TimeFilter::month(now.year(), now.month()));

        cache.set_filter(TimeFilter::all());
        loading.await.unwrap().unwrap();

        let state = cache.state();
        assert!(!state.is_loading_more);
        assert_eq!(state.filter, TimeFilter::all());
        assert_eq!(state.total_loaded, 300);
        assert_eq!(state.sessions.len(), 300);
    }

    /// One session per VIN, named `<vin>-1`; VIN "A" answers slowly.
    struct PerVinSource {
        calls: std::sync::Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl ChargingHistorySource for PerVinSource {
        async fn history_page(
            &self,
            vin: &str,
            _page: u32,
            _size: u32,
        ) -> Result<HistoryPage, ClientError> {
            *self.calls.lock().unwrap().entry(vin.to_string()).or_default() += 1;
            if vin == "A" {
                tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            }
            Ok(HistoryPage {
                sessions: vec![session(&format!("{}-1", vin), long_ago(0))],
                total_records: 1,
            })
        }
    }

    fn per_vin_cache() -> (ChargingHistoryCache, Arc<PerVinSource>) {
        let source = Arc::new(PerVinSource {
            calls: std::sync::Mutex::new(HashMap::new()),
        });
        let cache = ChargingHistoryCache::new(
            source.clone(),
            Arc::new(MemoryStore::new()),
            HistorySettings::default(),
        );
        (cache, source)
    }

    fn shown_ids(cache: &ChargingHistoryCache) -> (Option<String>, Vec<String>) {
        let state = cache.state();
        let ids = state.sessions.iter().filter_map(|s| s.id.clone()).collect();
        (state.loaded_vin, ids)
    }

    #[tokio::test]
    async fn joined_load_shows_the_latest_requested_vin() {
        let (cache, source) = per_vin_cache();
        cache.fetch("B", false).await.unwrap();

        let first_a = tokio::spawn({
            let cache = cache.clone();
            async move { cache.fetch("A", false).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        cache.fetch("B", false).await.unwrap();
        assert_eq!(shown_ids(&cache).0.as_deref(), Some("B"));

        cache.fetch("A", false).await.unwrap();
        first_a.await.unwrap().unwrap();

        assert_eq!(shown_ids(&cache), (Some("A".to_string()), vec!["A-1".to_string()]));
        assert!(!cache.state().is_loading);
        assert_eq!(source.calls.lock().unwrap().get("A"), Some(&1));
    }

    #[tokio::test]
    async fn superseded_load_leaves_the_newer_vin_on_display() {
        let (cache, _) = per_vin_cache();
        cache.fetch("B", false).await.unwrap();

        let stale_a = tokio::spawn({
            let cache = cache.clone();
            async move { cache.fetch("A", false).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cache.fetch("B", false).await.unwrap();
        stale_a.await.unwrap().unwrap();

        assert_eq!(shown_ids(&cache), (Some("B".to_string()), vec!["B-1".to_string()]));
        assert!(cache.cached_entry("A").await.is_some());
    }

    /// Claims an enormous total and hands out one session per page.
    struct BottomlessSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChargingHistorySource for BottomlessSource {
        async fn history_page(
            &self,
            _vin: &str,
            page: u32,
            _size: u32,
        ) -> Result<HistoryPage, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HistoryPage {
                sessions: vec![session(&format!("p{}", page), long_ago(page as usize))],
                total_records: u64::MAX,
            })
        }
    }

    #[tokio::test]
    async fn page_count_is_capped() {
        let source = Arc::new(BottomlessSource {
            calls: AtomicUsize::new(0),
        });
        let cache = ChargingHistoryCache::new(
            source.clone(),
            Arc::new(MemoryStore::new()),
            HistorySettings {
                page_size: 1,
                max_pages: 3,
                ..HistorySettings::default()
            },
        );

        cache.fetch("VIN1", false).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        let state = cache.state();
        assert_eq!(state.total_loaded, 3);
        assert_eq!(state.total_records, u64::MAX);
    }

    #[tokio::test]
    async fn corrupt_or_stale_persisted_cache_is_a_miss() {
        let storage: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        storage.set(HISTORY_CACHE_KEY, "{broken").unwrap();
        let source = Arc::new(PagedSource::new(vec![session("s0", long_ago(0))]));
        let cache = cache_for(source.clone(), storage.clone());
        assert!(cache.cached_entry("VIN1").await.is_none());
        assert!(storage.get(HISTORY_CACHE_KEY).is_none());

        let stale: HashMap<String, VinCacheEntry> = HashMap::from([(
            "VIN1".to_string(),
            VinCacheEntry {
                sessions: vec![session("old", long_ago(0))],
                total_records: 1,
                fetched_at: Utc::now() - Duration::hours(25),
            },
        )]);
        storage
            .set(HISTORY_CACHE_KEY, &serde_json::to_string(&stale).unwrap())
            .unwrap();
        let cache = cache_for(source.clone(), storage);
        assert!(cache.cached_entry("VIN1").await.is_none());
        cache.fetch("VIN1", false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prune_keeps_most_recent_vins() {
        let now = Utc::now();
        let settings = HistorySettings::default();
        let mut entries: HashMap<String, VinCacheEntry> = (0..8)
            .map(|i| {
                (
                    format!("VIN{}", i),
                    VinCacheEntry {
                        sessions: Vec::new(),
                        total_records: 0,
                        fetched_at: now - Duration::minutes(i),
                    },
                )
            })
            .collect();
        prune(&mut entries, &settings, now);
        assert_eq!(entries.len(), 5);
        assert!(entries.contains_key("VIN0"));
        assert!(!entries.contains_key("VIN7"));
    }
}
