//! Rule registry: the in-memory rule table plus the runtime maps of the
//! lifecycle manager, all behind one mutex.
//!
//! Lock order across the crate is save lock, then registry lock, then a
//! counter lock. File writes never happen under the registry lock.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, error, info};

use crate::error::{FleetError, FleetResult};
use crate::instrumented::InstrumentedListener;
use crate::lifecycle::ServerHandle;
use crate::rule::{next_rule_id, Rule};
use crate::store::{RuleStore, StoreError};
use crate::traffic::{FlushTarget, TrafficCounter};

/// Core settings shared by every instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetOptions {
    /// Interface the per-rule TCP listeners bind to
    pub listen_ip: IpAddr,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Everything guarded by the registry lock. An id present in `listeners`
/// is running.
#[derive(Debug, Default)]
pub(crate) struct FleetState {
    pub(crate) rules: Vec<Rule>,
    pub(crate) servers: HashMap<String, ServerHandle>,
    pub(crate) listeners: HashMap<String, InstrumentedListener>,
    pub(crate) counters: HashMap<String, Arc<TrafficCounter>>,
}

impl FleetState {
    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.id == id)
    }

    pub(crate) fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }
}

pub(crate) fn rule_mut<'a>(rules: &'a mut [Rule], id: &str) -> Option<&'a mut Rule> {
    rules.iter_mut().find(|r| r.id == id)
}

pub(crate) struct Shared {
    me: Weak<Shared>,
    state: Mutex<FleetState>,
    save_lock: Mutex<()>,
    store: RuleStore,
    pub(crate) options: FleetOptions,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn flush_target(&self) -> Weak<dyn FlushTarget> {
        self.me.clone()
    }

    /// Snapshot the rules under the registry lock and write them outside it
    fn persist(&self) -> Result<(), StoreError> {
        let _saving = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.state().rules.clone();
        self.store.save(&snapshot)
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            error!("Failed to save rules: {}", e);
        }
    }
}

impl FlushTarget for Shared {
    fn absorb(&self, counter: &TrafficCounter) -> bool {
        let mut state = self.state();
        let Some(rule) = rule_mut(&mut state.rules, counter.rule_id()) else {
            debug!("Dropping traffic for removed rule {}", counter.rule_id());
            return false;
        };
        let (upload, download) = counter.drain();
        rule.upload_bytes += upload;
        rule.download_bytes += download;
        true
    }

    fn persist_in_background(&self) {
        let Some(shared) = self.me.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || shared.persist_logged());
            }
            Err(_) => shared.persist_logged(),
        }
    }
}

/// Registry and lifecycle manager for a set of SOCKS5 rule instances.
///
/// Cheap to clone; clones share state. Operations that start servers must
/// run inside a Tokio runtime.
#[derive(Clone)]
pub struct Fleet {
    pub(crate) shared: Arc<Shared>,
}

impl Fleet {
    /// Empty fleet backed by `store`
    pub fn new(store: RuleStore, options: FleetOptions) -> Self {
        Self::with_rules(store, options, Vec::new())
    }

    /// Fleet initialised from the rules in `store`, all stopped
    pub fn open(store: RuleStore, options: FleetOptions) -> Result<Self, StoreError> {
        let rules = store.load()?;
        Ok(Self::with_rules(store, options, rules))
    }

    fn with_rules(store: RuleStore, options: FleetOptions, rules: Vec<Rule>) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            state: Mutex::new(FleetState {
                rules,
                ..FleetState::default()
            }),
            save_lock: Mutex::new(()),
            store,
            options,
        });
        Self { shared }
    }

    pub fn options(&self) -> FleetOptions {
        self.shared.options
    }

    pub fn rules_path(&self) -> &Path {
        self.shared.store.path()
    }

    /// Snapshot of every rule in insertion order
    pub fn list_rules(&self) -> Vec<Rule> {
        self.shared.state().rules.clone()
    }

    pub fn get_rule(&self, id: &str) -> Option<Rule> {
        self.shared.state().rule(id).cloned()
    }

    /// Append a rule, assigning `rule_<n>` when its id is blank.
    ///
    /// The rule is stored stopped with zeroed traffic.
    pub async fn add_rule(&self, mut rule: Rule) -> FleetResult<String> {
        rule.validate()?;
        let id = {
            let mut state = self.shared.state();
            if rule.id.is_empty() {
                rule.id = next_rule_id(&state.rules, state.rules.len() + 1);
            } else if state.rule(&rule.id).is_some() {
                return Err(FleetError::DuplicateId(rule.id));
            }
            rule.running = false;
            rule.upload_bytes = 0;
            rule.download_bytes = 0;
            let id = rule.id.clone();
            state.rules.push(rule);
            id
        };
        info!("Added rule {}", id);
        self.persist().await;
        Ok(id)
    }

    /// Replace a rule's configuration, keeping its traffic totals.
    ///
    /// A running rule is stopped first to release its port. It is started
    /// again under the new configuration when `rule.running` asks for it;
    /// `running` only ends up true if that bind succeeds. A failed restart
    /// is returned after the update has been applied and saved.
    ///
    /// Stop, replace and restart happen in one registry critical section.
    pub async fn update_rule(&self, rule: Rule) -> FleetResult<()> {
        let id = rule.id.clone();
        let wants_running = rule.running;
        let (detached, restarted) = {
            let mut state = self.shared.state();
            let idx = state
                .position(&id)
                .ok_or_else(|| FleetError::NotFound(id.clone()))?;
            rule.validate()?;

            let was_running = state.rules[idx].running;
            let detached = if was_running {
                Some(self.stop_locked(&mut state, &id)?)
            } else {
                None
            };

            let existing = &mut state.rules[idx];
            *existing = Rule {
                running: false,
                upload_bytes: existing.upload_bytes,
                download_bytes: existing.download_bytes,
                ..rule
            };

            let restarted = if was_running && wants_running {
                self.start_locked(&mut state, &id).map(|_| ())
            } else {
                Ok(())
            };
            (detached, restarted)
        };

        if let Some(detached) = detached {
            detached.finish().await;
        }
        self.persist().await;
        restarted
    }

    /// Remove a rule, stopping it first if it is running
    pub async fn delete_rule(&self, id: &str) -> FleetResult<()> {
        let detached = {
            let mut state = self.shared.state();
            let idx = state
                .position(id)
                .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
            let detached = if state.rules[idx].running {
                Some(self.stop_locked(&mut state, id)?)
            } else {
                None
            };
            state.rules.remove(idx);
            detached
        };

        if let Some(detached) = detached {
            detached.finish().await;
        }
        info!("Deleted rule {}", id);
        self.persist().await;
        Ok(())
    }

    /// Cumulative (upload, download) bytes as of the last flush
    pub fn traffic_stats(&self, id: &str) -> FleetResult<(u64, u64)> {
        self.shared
            .state()
            .rule(id)
            .map(Rule::traffic)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))
    }

    /// Unflushed (upload, download) bytes of a running rule's live counter
    #[cfg(test)]
    pub(crate) fn pending_traffic(&self, id: &str) -> Option<(u64, u64)> {
        self.shared.state().counters.get(id).map(|c| c.pending())
    }

    /// Zero the stored totals.
    ///
    /// The live counter of a running rule is left alone, so bytes it has not
    /// flushed yet are added on top of zero at its next flush.
    pub async fn reset_traffic_stats(&self, id: &str) -> FleetResult<()> {
        {
            let mut state = self.shared.state();
            let rule = rule_mut(&mut state.rules, id)
                .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
            rule.upload_bytes = 0;
            rule.download_bytes = 0;
        }
        self.persist().await;
        Ok(())
    }

    /// Write the current rules to the store
    pub async fn save_rules(&self) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.shared);
        match tokio::task::spawn_blocking(move || shared.persist()).await {
            Ok(res) => res,
            Err(e) => Err(StoreError::Io {
                path: self.rules_path().to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            }),
        }
    }

    /// Save, logging instead of returning failures
    pub(crate) async fn persist(&self) {
        if let Err(e) = self.save_rules().await {
            error!("Failed to save rules: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleError;
    use tempfile::TempDir;

    fn fleet(dir: &TempDir) -> Fleet {
        Fleet::new(
            RuleStore::new(dir.path().join("rules.json")),
            FleetOptions::default(),
        )
    }

    fn saved(dir: &TempDir) -> Vec<Rule> {
        RuleStore::new(dir.path().join("rules.json")).load().unwrap()
    }

    #[tokio::test]
    async fn test_add_assigns_id_and_zeroes_traffic() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        let mut rule = Rule::open("test", 1080);
        rule.upload_bytes = 77;
        rule.running = true;

        let id = fleet.add_rule(rule).await.unwrap();

        assert_eq!(id, "rule_1");
        let rules = fleet.list_rules();
        assert_eq!(rules.iter().filter(|r| r.id == id).count(), 1);
        assert_eq!(rules[0].traffic(), (0, 0));
        assert!(!rules[0].running);
        assert_eq!(saved(&dir), rules);
    }

    #[tokio::test]
    async fn test_add_keeps_explicit_id_and_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        let rule = Rule {
            id: "office".into(),
            ..Rule::open("a", 1080)
        };

        assert_eq!(fleet.add_rule(rule.clone()).await.unwrap(), "office");
        assert!(matches!(
            fleet.add_rule(rule).await,
            Err(FleetError::DuplicateId(id)) if id == "office"
        ));
        assert_eq!(fleet.list_rules().len(), 1);
    }

    #[tokio::test]
    async fn test_generated_id_skips_taken_ids() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        fleet.add_rule(Rule::open("a", 1080)).await.unwrap();
        fleet.add_rule(Rule::open("b", 1081)).await.unwrap();
        fleet.delete_rule("rule_1").await.unwrap();

        let id = fleet.add_rule(Rule::open("c", 1082)).await.unwrap();
        assert_eq!(id, "rule_3");
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_rule() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);

        let err = fleet.add_rule(Rule::open("a", 0)).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidRule(RuleError::InvalidPort)));

        let no_password = Rule::with_credentials("b", 1080, "alice", "");
        let err = fleet.add_rule(no_password).await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::InvalidRule(RuleError::MissingCredentials)
        ));
        assert!(fleet.list_rules().is_empty());
    }

    #[tokio::test]
    async fn test_update_preserves_traffic() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        let id = fleet.add_rule(Rule::open("a", 1080)).await.unwrap();
        {
            let mut state = fleet.shared.state();
            let rule = rule_mut(&mut state.rules, &id).unwrap();
            rule.upload_bytes = 10;
            rule.download_bytes = 20;
        }

        let update = Rule {
            id: id.clone(),
            upload_bytes: 0,
            download_bytes: 999,
            ..Rule::with_credentials("renamed", 2080, "alice", "secret")
        };
        fleet.update_rule(update).await.unwrap();

        let rule = fleet.get_rule(&id).unwrap();
        assert_eq!(rule.name, "renamed");
        assert_eq!(rule.port, 2080);
        assert!(!rule.no_auth);
        assert_eq!(rule.traffic(), (10, 20));
        assert_eq!(saved(&dir)[0].traffic(), (10, 20));
    }

    #[tokio::test]
    async fn test_update_and_delete_unknown_id() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        fleet.add_rule(Rule::open("a", 1080)).await.unwrap();
        let before = fleet.list_rules();

        let ghost = Rule {
            id: "ghost".into(),
            ..Rule::open("g", 1081)
        };
        assert!(fleet.update_rule(ghost).await.unwrap_err().is_not_found());
        assert!(fleet.delete_rule("ghost").await.unwrap_err().is_not_found());
        assert!(fleet.traffic_stats("ghost").unwrap_err().is_not_found());
        assert!(fleet.reset_traffic_stats("ghost").await.unwrap_err().is_not_found());
        assert_eq!(fleet.list_rules(), before);
    }

    #[tokio::test]
    async fn test_delete_keeps_order_of_the_rest() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        for (name, port) in [("a", 1080), ("b", 1081), ("c", 1082)] {
            fleet.add_rule(Rule::open(name, port)).await.unwrap();
        }

        fleet.delete_rule("rule_2").await.unwrap();

        let names: Vec<_> = fleet.list_rules().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["a", "c"]);
        assert_eq!(saved(&dir).len(), 2);
    }

    #[tokio::test]
    async fn test_counter_flush_lands_in_rule() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        let id = fleet.add_rule(Rule::open("a", 1080)).await.unwrap();

        let counter = TrafficCounter::new(id.clone(), fleet.shared.flush_target());
        counter.count_upload(500);
        counter.count_download(1000);
        assert_eq!(fleet.traffic_stats(&id).unwrap(), (0, 0));

        counter.flush();
        assert_eq!(fleet.traffic_stats(&id).unwrap(), (500, 1000));
        assert_eq!(counter.pending(), (0, 0));

        fleet.reset_traffic_stats(&id).await.unwrap();
        assert_eq!(fleet.traffic_stats(&id).unwrap(), (0, 0));
        assert_eq!(saved(&dir)[0].traffic(), (0, 0));
    }

    #[tokio::test]
    async fn test_flush_for_deleted_rule_is_dropped() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        let id = fleet.add_rule(Rule::open("a", 1080)).await.unwrap();
        let counter = TrafficCounter::new(id.clone(), fleet.shared.flush_target());
        fleet.delete_rule(&id).await.unwrap();

        counter.count_upload(5);
        counter.flush();

        assert_eq!(counter.flush_count(), 0);
        assert!(fleet.list_rules().is_empty());
    }

    #[tokio::test]
    async fn test_open_loads_rules_stopped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(
            &path,
            r#"[{"id":"","name":"a","port":1080,"noAuth":true,"running":true,"uploadBytes":3,"downloadBytes":4}]"#,
        )
        .unwrap();

        let fleet = Fleet::open(RuleStore::new(&path), FleetOptions::default()).unwrap();

        let rules = fleet.list_rules();
        assert_eq!(rules[0].id, "rule_1");
        assert!(!rules[0].running);
        assert_eq!(fleet.traffic_stats("rule_1").unwrap(), (3, 4));
        assert_eq!(fleet.rules_path(), path.as_path());
    }

    #[tokio::test]
    async fn test_open_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            Fleet::open(RuleStore::new(&path), FleetOptions::default()),
            Err(StoreError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found_even_when_invalid() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        let ghost = Rule {
            id: "ghost".into(),
            ..Rule::open("g", 0)
        };

        assert!(matches!(
            fleet.update_rule(ghost).await,
            Err(FleetError::NotFound(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_update_known_id_still_validates() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        let id = fleet.add_rule(Rule::open("a", 1080)).await.unwrap();
        let invalid = Rule {
            id: id.clone(),
            ..Rule::open("a", 0)
        };

        let err = fleet.update_rule(invalid).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidRule(RuleError::InvalidPort)));
        assert_eq!(fleet.get_rule(&id).unwrap().port, 1080);
    }

    #[tokio::test]
    async fn test_every_tenth_flush_saves_rules_file() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir);
        let id = fleet.add_rule(Rule::open("a", 1080)).await.unwrap();
        let counter = TrafficCounter::new(id.clone(), fleet.shared.flush_target());

        for _ in 0..crate::traffic::PERSIST_EVERY_FLUSHES - 1 {
            counter.count_upload(1);
            counter.flush();
        }
        assert_eq!(fleet.traffic_stats(&id).unwrap(), (9, 0));
        assert_eq!(saved(&dir)[0].traffic(), (0, 0));

        counter.count_upload(1);
        counter.flush();

        let mut on_disk = saved(&dir)[0].traffic();
        for _ in 0..100 {
            if on_disk == (10, 0) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            on_disk = saved(&dir)[0].traffic();
        }
        assert_eq!(on_disk, (10, 0));
    }
}
