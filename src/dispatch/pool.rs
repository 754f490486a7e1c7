use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::Backend;
use crate::dispatch::http::HttpBackend;
use crate::error::DispatchError;

/// Which backend of the pool served (or should serve) a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSlot {
    Primary,
    Secondary,
}

impl BackendSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// Primary plus optional secondary backend. Built once at startup and
/// shared read-only across requests; the policy flags never change.
#[derive(Clone)]
pub struct ProviderPool {
    primary: Arc<dyn Backend>,
    secondary: Option<Arc<dyn Backend>>,
    racing: bool,
}

impl std::fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderPool")
            .field("primary", &self.primary.provider())
            .field("secondary", &self.secondary.as_ref().map(|s| s.provider()))
            .field("racing", &self.racing)
            .finish()
    }
}

impl ProviderPool {
    pub fn new(
        primary: Arc<dyn Backend>,
        secondary: Option<Arc<dyn Backend>>,
        enable_racing: bool,
    ) -> Self {
        let racing = enable_racing && secondary.is_some();
        if enable_racing && !racing {
            tracing::warn!("racing requested but no secondary backend: racing disabled");
        }
        Self {
            primary,
            secondary,
            racing,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, DispatchError> {
        let primary: Arc<dyn Backend> = Arc::new(HttpBackend::new(config.primary.clone())?);
        let secondary = match &config.secondary {
            Some(cfg) => Some(Arc::new(HttpBackend::new(cfg.clone())?) as Arc<dyn Backend>),
            None => None,
        };
        Ok(Self::new(primary, secondary, config.dispatch.enable_racing))
    }

    pub fn primary(&self) -> &Arc<dyn Backend> {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Arc<dyn Backend>> {
        self.secondary.as_ref()
    }

    /// Backend for a slot. Falls back to primary when no secondary exists.
    pub fn backend(&self, slot: BackendSlot) -> &Arc<dyn Backend> {
        match slot {
            BackendSlot::Primary => &self.primary,
            BackendSlot::Secondary => self.secondary.as_ref().unwrap_or(&self.primary),
        }
    }

    pub fn load_balancing_active(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn racing_enabled(&self) -> bool {
        self.racing
    }

    /// Batch split for this pool: even split when a secondary exists,
    /// everything to primary otherwise.
    pub fn split_for_batch(&self, n: usize) -> (usize, usize) {
        if self.load_balancing_active() {
            split_evenly(n)
        } else {
            (n, 0)
        }
    }

    /// Slot assignment for every index of an `n`-item batch, in order.
    pub fn assign_batch(&self, n: usize) -> Vec<BackendSlot> {
        let (first, _) = self.split_for_batch(n);
        (0..n)
            .map(|i| {
                if i < first {
                    BackendSlot::Primary
                } else {
                    BackendSlot::Secondary
                }
            })
            .collect()
    }
}

/// `ceil(n/2)` to primary, the rest to secondary. Ties favour primary.
pub fn split_evenly(n: usize) -> (usize, usize) {
    let first = n.div_ceil(2);
    (first, n - first)
}
