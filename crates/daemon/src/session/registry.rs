//! Session registry: at most one session host per session key.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::SessionKey;

use super::host::{HostInfo, HostSettings, ProcessBinding, SessionHost};
use super::viewer::{Attachment, ViewerHandle};
use super::SessionError;
use crate::process::{ProcessHandle, ProcessManager};

/// Default time a terminated host with no viewers is kept for reconnects.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Notice sent to viewers of a host replaced by a newer process run.
pub const SUPERSEDED_NOTICE: &str = "process restarted; reconnect to follow the new run";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub host: HostSettings,
    pub teardown_grace: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            host: HostSettings::default(),
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
        }
    }
}

pub struct SessionRegistry {
    hosts: DashMap<SessionKey, Arc<SessionHost>>,
    processes: Arc<dyn ProcessManager>,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(processes: Arc<dyn ProcessManager>, settings: RegistrySettings) -> Arc<Self> {
        Arc::new(Self {
            hosts: DashMap::new(),
            processes,
            settings,
        })
    }

    pub fn processes(&self) -> &Arc<dyn ProcessManager> {
        &self.processes
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Attach a new viewer to the host for `key`, creating the host if
    /// needed.
    ///
    /// # Errors
    ///
    /// `NoSuchTarget` if the process manager does not know `key`;
    /// `ProcessNotRunning` if no host exists and the process is idle.
    pub fn attach(
        self: &Arc<Self>,
        key: &SessionKey,
        history_depth: usize,
    ) -> Result<Attachment, SessionError> {
        let host = self.resolve(key)?;
        Ok(host.attach(history_depth))
    }

    /// Find or create the host for `key`. The map entry stays locked while
    /// a host is created, so concurrent attaches share one host.
    fn resolve(self: &Arc<Self>, key: &SessionKey) -> Result<Arc<SessionHost>, SessionError> {
        match self.hosts.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let current = Arc::clone(entry.get());
                if !current.is_terminated() && !self.is_new_run(key, &current)? {
                    return Ok(current);
                }
                let handle = self.processes.get_process_handle(key)?;
                match self.create_host(key, handle) {
                    Some(host) => {
                        let previous = entry.insert(Arc::clone(&host));
                        previous.retire(SUPERSEDED_NOTICE);
                        Ok(host)
                    }
                    // Still down: join the old host for its history.
                    None => Ok(current),
                }
            }
            Entry::Vacant(entry) => {
                let handle = self.processes.get_process_handle(key)?;
                let host = self
                    .create_host(key, handle)
                    .ok_or_else(|| SessionError::ProcessNotRunning(key.clone()))?;
                entry.insert(Arc::clone(&host));
                Ok(host)
            }
        }
    }

    /// Whether the process was restarted under a host whose pump has not
    /// yet seen the old run end.
    fn is_new_run(&self, key: &SessionKey, host: &SessionHost) -> Result<bool, SessionError> {
        let status = self.processes.status(key)?;
        Ok(status.is_running() && status.pid() != host.pid())
    }

    fn create_host(
        self: &Arc<Self>,
        key: &SessionKey,
        mut handle: ProcessHandle,
    ) -> Option<Arc<SessionHost>> {
        if !handle.running {
            return None;
        }
        let output = handle.output.take()?;
        let host = SessionHost::new(
            key.clone(),
            ProcessBinding {
                pid: handle.pid,
                backlog: handle.backlog,
                input: handle.input,
                resize: handle.resize,
            },
            self.settings.host,
        );

        let registry: Weak<Self> = Arc::downgrade(self);
        host.spawn_pump(output, move |host| {
            if let Some(registry) = registry.upgrade() {
                registry.evaluate_teardown(&host);
            }
        });

        tracing::info!(
            session_id = %key.session_id(),
            host_id = %host.id(),
            pid = ?handle.pid,
            "Session host created"
        );
        Some(host)
    }

    /// Detach a viewer. Safe to call more than once.
    pub fn detach(self: &Arc<Self>, viewer: &ViewerHandle) -> bool {
        let removed = viewer.host().detach(viewer.id());
        if removed {
            self.evaluate_teardown(viewer.host());
        }
        removed
    }

    /// Schedule removal of a terminated host that has no viewers left.
    ///
    /// The timer is tied to the host's current membership epoch. Any attach
    /// or detach in the meantime makes it a no-op, so only the timer armed by
    /// the latest detach can remove the host.
    fn evaluate_teardown(self: &Arc<Self>, host: &Arc<SessionHost>) {
        if !host.is_terminated() || host.viewer_count() > 0 {
            return;
        }
        let epoch = host.membership_epoch();
        let grace = self.settings.teardown_grace;
        if grace.is_zero() {
            self.remove_if_idle(host, epoch);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.remove_if_idle(host, epoch);
            return;
        };
        let registry = Arc::downgrade(self);
        let host = Arc::clone(host);
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_idle(&host, epoch);
            }
        });
    }

    fn remove_if_idle(&self, host: &Arc<SessionHost>, epoch: u64) -> bool {
        let removed = self
            .hosts
            .remove_if(host.key(), |_, current| {
                Arc::ptr_eq(current, host)
                    && host.is_terminated()
                    && host.viewer_count() == 0
                    && host.membership_epoch() == epoch
            })
            .is_some();
        if removed {
            tracing::info!(
                session_id = %host.key().session_id(),
                host_id = %host.id(),
                "Session host removed"
            );
        } else {
            tracing::trace!(
                session_id = %host.key().session_id(),
                host_id = %host.id(),
                epoch,
                "Teardown skipped"
            );
        }
        removed
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionHost>> {
        self.hosts.get(key).map(|h| Arc::clone(h.value()))
    }

    /// Status of every host, ordered by session id.
    pub fn list(&self) -> Vec<HostInfo> {
        let hosts: Vec<Arc<SessionHost>> =
            self.hosts.iter().map(|h| Arc::clone(h.value())).collect();
        let mut infos: Vec<HostInfo> = hosts.iter().map(|h| h.info()).collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    pub fn count(&self) -> usize {
        self.hosts.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.hosts.iter().map(|h| h.viewer_count()).sum()
    }

    /// Retire and remove every host.
    pub fn shutdown(&self, reason: &str) {
        let keys: Vec<SessionKey> = self.hosts.iter().map(|h| h.key().clone()).collect();
        for key in keys {
            if let Some((_, host)) = self.hosts.remove(&key) {
                host.retire(reason);
            }
        }
    }
}
