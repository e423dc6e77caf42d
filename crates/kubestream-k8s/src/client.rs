//! Kubernetes client construction

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Kubeconfig-backed client factory
pub struct KubeClient {
    kubeconfig: Option<Kubeconfig>,
    current_context: Option<String>,
}

impl KubeClient {
    /// Load the kubeconfig if there is one; in-cluster config is used otherwise
    pub fn new() -> Self {
        let kubeconfig = Kubeconfig::read().ok();
        let current_context = kubeconfig
            .as_ref()
            .and_then(|config| config.current_context.clone());

        Self {
            kubeconfig,
            current_context,
        }
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Create a kube::Client for a context, or the default one when `context` is `None`
    pub async fn connect(&self, context: Option<&str>) -> Result<kube::Client> {
        let Some(context_name) = context else {
            return kube::Client::try_default()
                .await
                .context("Failed to infer Kubernetes config. Is kubectl configured?");
        };

        let kubeconfig = self
            .kubeconfig
            .clone()
            .context("Failed to read kubeconfig. Is kubectl configured?")?;

        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(context_name.to_string()),
                ..Default::default()
            },
        )
        .await
        .context(format!(
            "Failed to create config for context: {}",
            context_name
        ))?;

        kube::Client::try_from(config).context(format!(
            "Failed to create client for context: {}",
            context_name
        ))
    }
}

impl Default for KubeClient {
    fn default() -> Self {
        Self::new()
    }
}
