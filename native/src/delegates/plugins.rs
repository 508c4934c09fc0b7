// Plugin queries. Activity and presence are answered from one memoized listing each.

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::{delegate, HostError};
use crate::ipc::Arg;

#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Plugin file names, only the active ones when `active_only` is set.
    async fn get_all(&self, active_only: bool) -> Result<Vec<String>, HostError>;
}

pub struct PluginProxy {
    host: Arc<dyn PluginHost>,
    active: OnceCell<HashSet<String>>,
    present: OnceCell<HashSet<String>>,
}

impl PluginProxy {
    pub fn new(host: Arc<dyn PluginHost>) -> Self {
        Self {
            host,
            active: OnceCell::new(),
            present: OnceCell::new(),
        }
    }

    pub async fn get_all(&self, active_only: bool) -> Result<Vec<String>, HostError> {
        self.host.get_all(active_only).await
    }

    /// Case-insensitive. The active list is fetched once per proxy.
    pub async fn is_active(&self, name: &str) -> Result<bool, HostError> {
        let active = self
            .active
            .get_or_try_init(|| self.load(true))
            .await?;
        Ok(active.contains(&name.to_lowercase()))
    }

    /// Case-insensitive. The full list is fetched once per proxy.
    pub async fn is_present(&self, name: &str) -> Result<bool, HostError> {
        let present = self
            .present
            .get_or_try_init(|| self.load(false))
            .await?;
        Ok(present.contains(&name.to_lowercase()))
    }

    async fn load(&self, active_only: bool) -> Result<HashSet<String>, HostError> {
        let names = self.host.get_all(active_only).await?;
        debug!(
            "[DELEGATE] Cached {} {} plugins",
            names.len(),
            if active_only { "active" } else { "installed" }
        );
        Ok(names.into_iter().map(|name| name.to_lowercase()).collect())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetAllArgs {
    #[serde(default)]
    active_only: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginArgs {
    plugin_name: String,
}

pub(crate) fn bind(proxy: Arc<PluginProxy>) -> Arg {
    let get_all = Arc::clone(&proxy);
    let is_active = Arc::clone(&proxy);
    let is_present = proxy;
    Arg::object([
        (
            "getAll",
            delegate("getAll", move |args: GetAllArgs| {
                let proxy = Arc::clone(&get_all);
                async move { proxy.get_all(args.active_only).await }
            }),
        ),
        (
            "isActive",
            delegate("isActive", move |args: PluginArgs| {
                let proxy = Arc::clone(&is_active);
                async move { proxy.is_active(&args.plugin_name).await }
            }),
        ),
        (
            "isPresent",
            delegate("isPresent", move |args: PluginArgs| {
                let proxy = Arc::clone(&is_present);
                async move { proxy.is_present(&args.plugin_name).await }
            }),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHost {
        active_calls: AtomicUsize,
        all_calls: AtomicUsize,
    }

    #[async_trait]
    impl PluginHost for CountingHost {
        async fn get_all(&self, active_only: bool) -> Result<Vec<String>, HostError> {
            if active_only {
                self.active_calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec!["Skyrim.esm".to_string(), "Textures.esp".to_string()])
            } else {
                self.all_calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![
                    "Skyrim.esm".to_string(),
                    "Textures.esp".to_string(),
                    "Disabled.esp".to_string(),
                ])
            }
        }
    }

    struct FailingHost;

    #[async_trait]
    impl PluginHost for FailingHost {
        async fn get_all(&self, _active_only: bool) -> Result<Vec<String>, HostError> {
            Err(HostError::Failed("load order unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn activity_is_memoized() {
        let host = Arc::new(CountingHost::default());
        let proxy = PluginProxy::new(host.clone());

        for _ in 0..5 {
            assert!(proxy.is_active("textures.ESP").await.unwrap());
        }
        assert!(!proxy.is_active("Disabled.esp").await.unwrap());
        assert_eq!(host.active_calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.all_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn presence_uses_the_full_listing() {
        let host = Arc::new(CountingHost::default());
        let proxy = PluginProxy::new(host.clone());

        assert!(proxy.is_present("DISABLED.esp").await.unwrap());
        assert!(proxy.is_present("skyrim.esm").await.unwrap());
        assert!(!proxy.is_present("Missing.esp").await.unwrap());
        assert_eq!(host.all_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_all_is_not_cached() {
        let host = Arc::new(CountingHost::default());
        let proxy = PluginProxy::new(host.clone());

        proxy.get_all(true).await.unwrap();
        proxy.get_all(true).await.unwrap();
        assert_eq!(host.active_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_proxy_sees_fresh_state() {
        let host = Arc::new(CountingHost::default());
        PluginProxy::new(host.clone())
            .is_active("Skyrim.esm")
            .await
            .unwrap();
        PluginProxy::new(host.clone())
            .is_active("Skyrim.esm")
            .await
            .unwrap();
        assert_eq!(host.active_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let proxy = PluginProxy::new(Arc::new(FailingHost));
        assert!(proxy.is_active("A.esp").await.is_err());
        assert!(proxy.is_active("A.esp").await.is_err());
    }
}
