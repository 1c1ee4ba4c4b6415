use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

/// Which pipeline owns the routers of this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConfigMode {
    #[default]
    Disabled,
    BGPv1,
    BGPv2,
}

impl std::fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigMode::Disabled => write!(f, "disabled"),
            ConfigMode::BGPv1 => write!(f, "bgpv1"),
            ConfigMode::BGPv2 => write!(f, "bgpv2"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mode {
    inner: Arc<RwLock<ConfigMode>>,
}

impl Mode {
    pub fn get(&self) -> ConfigMode {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `mode` and return the previous one.
    pub fn set(&self, mode: ConfigMode) -> ConfigMode {
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_returns_previous() {
        let mode = Mode::default();
        assert_eq!(ConfigMode::Disabled, mode.get());
        assert_eq!(ConfigMode::Disabled, mode.set(ConfigMode::BGPv1));
        assert_eq!(ConfigMode::BGPv1, mode.clone().set(ConfigMode::BGPv2));
        assert_eq!(ConfigMode::BGPv2, mode.get());
    }
}
